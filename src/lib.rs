pub mod app;
pub mod batch;
pub mod biosample;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod download;
pub mod error;
pub mod ftp;
pub mod inspect;
pub mod mapping;
pub mod matcher;
pub mod metadata;
pub mod nmdc;
pub mod objectstore;
pub mod output;
pub mod process;
pub mod retry;
pub mod separator;
pub mod state;
pub mod store;
pub mod submit;
pub mod tools;
