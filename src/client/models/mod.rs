pub mod article;
pub mod conversation;
pub mod notifications;
pub mod session;
