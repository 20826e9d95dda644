pub mod local_api;
pub mod middleware;
pub mod response;
