//! Database entities

pub mod request_log;

pub use request_log::Entity as RequestLog;

pub mod prelude {
    pub use super::request_log::Entity as RequestLog;
}
