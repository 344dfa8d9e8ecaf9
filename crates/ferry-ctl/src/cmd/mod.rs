pub mod files;
pub mod http;
pub mod links;
pub mod shaper;
pub mod transfers;
