pub mod agents;
pub mod assessments;
pub mod conversations;
pub mod health;
pub mod login;
pub mod messages;
pub mod scenarios;
pub mod users;
