pub mod aliases;
pub mod amqp;
pub mod app_error;
pub mod app_state;
pub mod auth;
pub mod bootstrap;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod enums;
pub mod middleware;
pub mod models;
pub mod pagination;
pub mod policy;
pub mod resources;
pub mod routes;
pub mod schema;
pub mod services;
pub mod storage;
