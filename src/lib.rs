pub mod config;
pub mod gateway;
pub mod packet;
pub mod pool;
pub mod session;
pub mod test_util;
pub mod tunnel;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
