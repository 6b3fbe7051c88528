pub(crate) mod engine;

pub(crate) mod kv_app;

pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod mempool;

pub(crate) mod network;

pub(crate) mod scheduler;

pub(crate) mod validators;
