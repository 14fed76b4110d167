//! Server lifecycle and the shared context
//!
//! [`Server`] owns the configured plugins and the worker pool. Workers
//! share one [`Context`]: configuration, the descriptor registry, the
//! global poller and the buffer pool.
//!
//! # State
//!
//! ```text
//!   INIT ──start──► RUNNING ──shutdown──► SHUTDOWN
//! ```
//!
//! Transitions are compare-and-swap; each worker checks the state at the
//! top of every loop iteration, so shutdown takes effect within one poll
//! timeout.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::comm::Registry;
use crate::config::Config;
use crate::constants::BUFFER_HWM;
use crate::error::{Error, Result};
use crate::event::Poller;
use crate::plugin::{configure, Plugin};
use crate::worker::{pin_to_cpus, GlobalHandler, Worker, WorkerPool};

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// State shared by every worker thread.
pub struct Context {
    config: Config,
    registry: Arc<Registry>,
    global: Poller<GlobalHandler>,
    buffers: Arc<BufferPool>,
    state: AtomicU8,
}

impl Context {
    pub fn new(config: Config) -> Result<Self> {
        let registry = Arc::new(Registry::new(config.main.maxfd));
        let global = Poller::new(Arc::clone(&registry))?;
        let buffers = BufferPool::new(config.mem(), BUFFER_HWM);
        Ok(Self {
            config,
            registry,
            global,
            buffers,
            state: AtomicU8::new(STATE_INIT),
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[inline]
    pub fn global(&self) -> &Poller<GlobalHandler> {
        &self.global
    }

    #[inline]
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn begin(&self) -> bool {
        self.state
            .compare_exchange(STATE_INIT, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ask every worker to stop. Returns false if not running.
    pub fn shutdown(&self) -> bool {
        let switched = self
            .state
            .compare_exchange(STATE_RUNNING, STATE_SHUTDOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if switched {
            tracing::info!("shutdown requested");
        }
        switched
    }

    /// Drop global callbacks for `fd` and close it.
    pub fn close(&self, fd: std::os::fd::RawFd) -> Result<()> {
        self.global.forget(fd);
        self.registry.close(fd)
    }
}

type Plugins = Arc<[Box<dyn Plugin>]>;

pub struct Server {
    ctx: Arc<Context>,
    plugins: Plugins,
    pool: WorkerPool,
    started: bool,
}

impl Server {
    /// Validate the config and feed each block to the plugin that owns it.
    pub fn new(config: Config, mut plugins: Vec<Box<dyn Plugin>>) -> Result<Self> {
        config.validate().map_err(Error::Invalid)?;

        for block in &config.blocks {
            let plugin = plugins
                .iter_mut()
                .find(|p| p.name() == block.name)
                .ok_or_else(|| Error::Config(format!("no plugin handles block `{}`", block.name)))?;
            configure(plugin.as_mut(), block)?;
        }

        Ok(Self {
            ctx: Arc::new(Context::new(config)?),
            plugins: plugins.into(),
            pool: WorkerPool::new(),
            started: false,
        })
    }

    #[inline]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run the process start hooks and spawn the workers.
    pub fn start(&mut self) -> Result<()> {
        if !self.ctx.begin() {
            return Err(Error::State("server already started"));
        }

        for (i, plugin) in self.plugins.iter().enumerate() {
            if let Err(e) = plugin.on_work_process_start(&self.ctx) {
                tracing::error!(plugin = plugin.name(), "process start failed: {}", e);
                for p in self.plugins[..i].iter().rev() {
                    p.on_work_process_exit(&self.ctx);
                }
                self.ctx.shutdown();
                return Err(e);
            }
        }
        self.started = true;

        let threads = self.ctx.config().main.work_thread_num;
        let ctx = Arc::clone(&self.ctx);
        let plugins = Arc::clone(&self.plugins);
        if let Err(e) = self
            .pool
            .start(threads, move |id| worker_main(id, Arc::clone(&ctx), Arc::clone(&plugins)))
        {
            self.ctx.shutdown();
            return Err(e);
        }
        tracing::info!(threads, plugins = self.plugins.len(), "server started");
        Ok(())
    }

    /// Ask the workers to stop.
    pub fn shutdown(&self) -> bool {
        self.ctx.shutdown()
    }

    /// Wait for the workers, then run the process exit hooks.
    pub fn join(mut self) {
        self.pool.join();
        if self.started {
            for p in self.plugins.iter().rev() {
                p.on_work_process_exit(&self.ctx);
            }
        }
        tracing::info!("server stopped");
    }
}

fn worker_main(id: usize, ctx: Arc<Context>, plugins: Plugins) {
    let masks = ctx.config().cpu_masks();
    if !masks.is_empty() {
        let mask = masks[id % masks.len()];
        match pin_to_cpus(mask) {
            Ok(()) => tracing::debug!(worker = id, mask, "pinned to cpus"),
            Err(e) => tracing::warn!(worker = id, "cpu affinity failed: {}", e),
        }
    }

    let mut worker = match Worker::new(id, Arc::clone(&ctx)) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(worker = id, "worker init failed: {}", e);
            ctx.shutdown();
            return;
        }
    };

    let mut started = 0;
    for plugin in plugins.iter() {
        if let Err(e) = plugin.on_work_thread_start(&mut worker) {
            tracing::error!(worker = id, plugin = plugin.name(), "thread start failed: {}", e);
            ctx.shutdown();
            break;
        }
        started += 1;
    }

    tracing::debug!(worker = id, "dispatch loop running");
    while ctx.is_running() {
        worker.dispatch_once();
    }

    for plugin in plugins[..started].iter().rev() {
        plugin.on_work_thread_exit(&mut worker);
    }
    worker.close_all();
    tracing::debug!(worker = id, "worker exited");
}
