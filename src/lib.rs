pub mod config;
pub mod hal;
pub mod interlock;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod sonar;
