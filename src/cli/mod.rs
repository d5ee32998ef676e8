//! `ptq` subcommands.

pub mod commands;
