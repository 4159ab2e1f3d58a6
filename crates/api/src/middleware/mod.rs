pub mod request_id;
pub mod signature;
