pub mod config;
pub mod crypto;
pub mod dc_repr;
pub mod merkle;
pub mod readstate;
pub mod request;
