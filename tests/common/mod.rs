pub(crate) mod blocks;

pub(crate) mod cluster;

pub(crate) mod keys;

pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod network;

pub(crate) mod token_app;
