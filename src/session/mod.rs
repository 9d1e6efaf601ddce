pub mod agent_service;
pub mod request;
pub mod response;
pub mod router;
pub mod util;
