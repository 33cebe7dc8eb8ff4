use super::*;
use crate::engine::config::DispatcherConfig;
use crate::source::{MemorySource, MemorySourceConfig, MessageSource};

mod common;
use common::*;

mod housekeeping;
mod settlement;
