pub mod codec;
pub mod compress;
pub mod crypto;
pub mod packet;
pub mod signature;
