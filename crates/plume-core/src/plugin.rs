//! Protocol plugins
//!
//! A plugin is configured from its config block, then receives lifecycle
//! callbacks from the server:
//!
//! ```text
//!   create_ctx → set_directive* → destroy_ctx        (per config block)
//!   on_work_process_start                            (once, before workers)
//!     on_work_thread_start / on_work_thread_exit     (per worker thread)
//!   on_work_process_exit                             (once, after join)
//! ```
//!
//! A failing start hook aborts startup.

use std::sync::Arc;

use crate::config::Block;
use crate::dispatcher::Context;
use crate::error::{Error, Result};
use crate::worker::Worker;

pub trait Plugin: Send + Sync {
    /// Name of the config block this plugin owns.
    fn name(&self) -> &'static str;

    /// Directive keys accepted inside the block.
    fn directives(&self) -> &'static [&'static str] {
        &[]
    }

    /// A block is opening.
    fn create_ctx(&mut self) -> Result<()> {
        Ok(())
    }

    /// Apply one directive. Only keys from [`Plugin::directives`] arrive here.
    fn set_directive(&mut self, key: &str, args: &[String]) -> Result<()> {
        let _ = args;
        Err(Error::UnknownDirective {
            block: self.name().to_string(),
            directive: key.to_string(),
        })
    }

    /// The block closed; validate what was set.
    fn destroy_ctx(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_work_process_start(&self, ctx: &Arc<Context>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn on_work_process_exit(&self, ctx: &Arc<Context>) {
        let _ = ctx;
    }

    fn on_work_thread_start(&self, worker: &mut Worker) -> Result<()> {
        let _ = worker;
        Ok(())
    }

    fn on_work_thread_exit(&self, worker: &mut Worker) {
        let _ = worker;
    }
}

/// Feed one config block through a plugin's directive table.
pub fn configure(plugin: &mut dyn Plugin, block: &Block) -> Result<()> {
    plugin.create_ctx()?;
    for (key, args) in &block.directives {
        if !plugin.directives().contains(&key.as_str()) {
            return Err(Error::UnknownDirective {
                block: block.name.clone(),
                directive: key.clone(),
            });
        }
        plugin.set_directive(key, args)?;
        tracing::debug!(plugin = plugin.name(), directive = %key, ?args, "directive set");
    }
    plugin.destroy_ctx()
}

/// Parse a single-argument directive.
pub fn one_arg<T: std::str::FromStr>(plugin: &'static str, key: &str, args: &[String]) -> Result<T> {
    match args {
        [v] => v
            .trim()
            .parse()
            .map_err(|_| Error::plugin(plugin, format!("{key}: bad value `{v}`"))),
        _ => Err(Error::plugin(plugin, format!("{key}: expects one argument"))),
    }
}
