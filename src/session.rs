use std::sync::Arc;

use log::info;
use serde_json::Value;

use crate::breakpoint::{ApplyReport, Breakpoints, HandlerRegistry};
use crate::callbacks::HookOptions;
use crate::config::RunConfig;
use crate::crypt::Title;
use crate::detour::DetourChains;
use crate::err::HookError;
use crate::mem::{Memory, ProcessMemory};
use crate::vfs::{FileVirtualizer, PatchStack};

/// Everything hooked into one game process: the file virtualizer, the
/// breakpoint sites of the run configuration and the detour chains.
///
/// Dropping a session removes its sites.
pub struct Session {
    config: RunConfig,
    vfs: Arc<FileVirtualizer>,
    breakpoints: Breakpoints,
    detours: DetourChains,
}

impl Session {
    /// Create a session hooking the current process.
    pub fn new(config: RunConfig, patches: Arc<dyn PatchStack>) -> Self {
        Self::with_parts(
            config,
            patches,
            HandlerRegistry::new(),
            Arc::new(ProcessMemory),
            HookOptions::default(),
        )
    }

    /// Create a session from explicit parts. The file breakpoints are added
    /// to `registry`, next to whatever handlers it holds already.
    pub fn with_parts(
        config: RunConfig,
        patches: Arc<dyn PatchStack>,
        mut registry: HandlerRegistry,
        mem: Arc<dyn Memory>,
        options: HookOptions,
    ) -> Self {
        let vfs = FileVirtualizer::new(config.game, patches).with_fallbacks(config.fallbacks.clone());
        for path in &config.fileslist {
            vfs.register_filename(path);
        }
        let vfs = Arc::new(vfs);
        vfs.register_handlers(&mut registry);
        info!(
            "session for {}: {} file names, {} breakpoints",
            config.game,
            config.fileslist.len(),
            config.breakpoints.len()
        );
        Self {
            config,
            vfs,
            breakpoints: Breakpoints::new(registry, mem, options),
            detours: DetourChains::new(options),
        }
    }

    /// Installs the breakpoint sites of the configuration.
    ///
    /// # Safety
    ///
    /// See [`Breakpoints::apply`].
    pub unsafe fn apply(&self) -> Result<ApplyReport, HookError> {
        let sites = Value::Object(self.config.breakpoints.clone());
        unsafe { self.breakpoints.apply(&sites) }
    }

    /// Restores every site.
    pub fn remove(&self) -> Result<(), HookError> {
        self.breakpoints.remove_all()?;
        info!("session removed");
        Ok(())
    }

    /// The game of this session.
    pub fn title(&self) -> Title {
        self.config.game
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The file virtualizer.
    pub fn vfs(&self) -> &Arc<FileVirtualizer> {
        &self.vfs
    }

    /// The breakpoint sites.
    pub fn breakpoints(&self) -> &Breakpoints {
        &self.breakpoints
    }

    /// The detour chains.
    pub fn detours(&self) -> &DetourChains {
        &self.detours
    }
}
