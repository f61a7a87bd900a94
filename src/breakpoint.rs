//! Breakpoint sites and the handlers they dispatch to.
//!
//! A breakpoint configuration maps site addresses to ordered handler
//! invocations:
//!
//! ```json
//! {
//!     "0x4a1f30": {
//!         "cavesize": 6,
//!         "th135_file_header": { "file_hash": "[esp+8]", "file_key": "esp+0xc" },
//!         "log_args#2": { "value": "[esp+4]", "cave_exec": false }
//!     }
//! }
//! ```
//!
//! Handlers are looked up in a [`HandlerRegistry`] by name, with an optional
//! `#suffix` ignored so one handler can appear more than once per site.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::callbacks::HookOptions;
use crate::err::HookError;
use crate::expr::{self, Operand};
use crate::mem::Memory;
use crate::x86::{CodePatch, Registers};


const CAVE_EXEC_KEY: &str = "cave_exec";
const CAVE_SIZE_KEY: &str = "cavesize";

/// A breakpoint handler. Returns whether the code cave should run; if not,
/// the handler may have rewritten `retaddr` to resume elsewhere.
pub type Handler = dyn Fn(&mut Registers, &BreakpointInfo<'_>) -> bool + Send + Sync;

/// The parameters of one handler invocation.
///
/// The configured parameters are shared and never change; values derived at
/// trap time go into an overlay that shadows them.
pub struct BreakpointInfo<'a> {
    params: &'a Map<String, Value>,
    overlay: Map<String, Value>,
    mem: &'a dyn Memory,
}

impl<'a> BreakpointInfo<'a> {
    /// Wraps configured parameters.
    pub fn new(params: &'a Map<String, Value>, mem: &'a dyn Memory) -> Self {
        Self {
            params,
            overlay: Map::new(),
            mem,
        }
    }

    /// Returns a copy with `key` set in the overlay.
    pub fn with(&self, key: &str, value: impl Into<Value>) -> Self {
        let mut overlay = self.overlay.clone();
        overlay.insert(key.to_owned(), value.into());
        Self {
            params: self.params,
            overlay,
            mem: self.mem,
        }
    }

    /// Get a parameter, looking at the overlay first.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.overlay.get(key).or_else(|| self.params.get(key))
    }

    /// Returns false only if `cave_exec` is set to false.
    ///
    /// Handlers that change registers the cave would overwrite return this.
    pub fn cave_exec(&self) -> bool {
        self.get(CAVE_EXEC_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Resolves a bare register parameter to its slot.
    pub fn register<'r>(&self, regs: &'r mut Registers, key: &str) -> Option<&'r mut u32> {
        expr::register_pointer(regs, self.get(key)?)
    }

    /// Resolves a parameter to a non-null address.
    pub fn pointer(&self, regs: &Registers, key: &str) -> Option<u32> {
        expr::pointer(regs, self.mem, self.get(key)?)
    }

    /// Resolves a parameter to a value.
    pub fn immediate(&self, regs: &Registers, key: &str) -> Option<i32> {
        expr::immediate(regs, self.mem, self.get(key)?)
    }

    /// The process memory operands are resolved against.
    pub fn memory(&self) -> &'a dyn Memory {
        self.mem
    }
}

/// Handlers by name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as `name`, replacing any handler of that name.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut Registers, &BreakpointInfo<'_>) -> bool + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_owned(), Arc::new(handler));
    }

    /// Looks a handler up. Anything from the first `#` on is ignored.
    pub fn get(&self, name: &str) -> Option<Arc<Handler>> {
        let base = name.split_once('#').map_or(name, |(base, _)| base);
        self.handlers.get(base).cloned()
    }

    /// Whether a handler resolves for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// One handler invocation of a site, as configured.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerEntry {
    /// The handler name, possibly with a `#suffix`.
    pub name: String,
    /// The handler's parameters.
    pub params: Map<String, Value>,
}

/// The configuration of one site.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointConfig {
    /// The least number of bytes to overwrite at the site.
    pub cavesize: usize,
    /// Handler invocations, in the order they run.
    pub entries: Vec<HandlerEntry>,
}

impl BreakpointConfig {
    /// Reads a site object and checks every operand parses.
    pub fn from_json(value: &Value) -> Result<Self, HookError> {
        let obj = value
            .as_object()
            .ok_or_else(|| HookError::InvalidConfig("a site must be an object".into()))?;
        let mut cavesize = 0;
        let mut entries = vec![];
        for (key, val) in obj {
            if key == CAVE_SIZE_KEY {
                cavesize = val
                    .as_u64()
                    .ok_or_else(|| HookError::InvalidConfig(format!("bad {CAVE_SIZE_KEY}")))?
                    as usize;
                continue;
            }
            let params = val.as_object().ok_or_else(|| {
                HookError::InvalidConfig(format!("parameters of `{key}` must be an object"))
            })?;
            validate_params(params)?;
            entries.push(HandlerEntry {
                name: key.clone(),
                params: params.clone(),
            });
        }
        if entries.is_empty() {
            return Err(HookError::InvalidConfig("no handlers".into()));
        }
        Ok(Self { cavesize, entries })
    }
}

// Strings and numbers are operands; other values are left to the handler.
fn validate_params(params: &Map<String, Value>) -> Result<(), HookError> {
    for (key, val) in params {
        if key == CAVE_EXEC_KEY {
            if !val.is_boolean() {
                return Err(HookError::InvalidConfig(format!("`{key}` must be a bool")));
            }
            continue;
        }
        if val.is_string() || val.is_number() {
            Operand::from_json(val).map_err(|source| HookError::MalformedOperand {
                key: key.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

struct Link {
    name: String,
    handler: Arc<Handler>,
    params: Map<String, Value>,
}

/// The resolved handlers of a site.
pub struct HandlerChain {
    links: Vec<Link>,
}

impl HandlerChain {
    /// Resolves every handler of `config`.
    pub fn resolve(config: &BreakpointConfig, registry: &HandlerRegistry) -> Result<Self, HookError> {
        let links = config
            .entries
            .iter()
            .map(|e| {
                let handler = registry
                    .get(&e.name)
                    .ok_or_else(|| HookError::UnknownHandler(e.name.clone()))?;
                Ok(Link {
                    name: e.name.clone(),
                    handler,
                    params: e.params.clone(),
                })
            })
            .collect::<Result<Vec<_>, HookError>>()?;
        Ok(Self { links })
    }

    /// Runs the handlers on one trap.
    ///
    /// Handlers see the trapped code's own `esp`. If every handler asks for
    /// it, `retaddr` is pointed at `cave_addr`. Returns how many bytes the
    /// handlers moved `esp` by.
    pub fn dispatch(&self, regs: &mut Registers, mem: &dyn Memory, cave_addr: u32) -> i32 {
        // skip the return address the trap call pushed
        regs.esp = regs.esp.wrapping_add(4);
        let esp_before = regs.esp;

        let mut cave_exec = true;
        for link in &self.links {
            let info = BreakpointInfo::new(&link.params, mem);
            if !(link.handler)(regs, &info) {
                debug!("{} skips the code cave", link.name);
                cave_exec = false;
            }
        }
        if cave_exec {
            regs.retaddr = cave_addr;
        }

        let shift = regs.esp.wrapping_sub(esp_before) as i32;
        regs.esp = regs.esp.wrapping_sub(4);
        shift
    }
}

struct SiteState {
    addr: usize,
    chain: HandlerChain,
    mem: Arc<dyn Memory>,
    cave_addr: AtomicU32,
    in_flight: AtomicUsize,
}

impl SiteState {
    fn dispatch(&self, regs: &mut Registers) -> i32 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let saved = *regs;
        let cave_addr = self.cave_addr.load(Ordering::Acquire);
        let shift = match catch_unwind(AssertUnwindSafe(|| {
            self.chain.dispatch(regs, &*self.mem, cave_addr)
        })) {
            Ok(shift) => shift,
            Err(_) => {
                error!("breakpoint at {:#x} panicked, running the original code", self.addr);
                *regs = saved;
                regs.retaddr = cave_addr;
                0
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        shift
    }
}

unsafe extern "C" fn breakpoint_process(regs: *mut Registers, user_data: usize) -> i32 {
    let state = unsafe { &*(user_data as *const SiteState) };
    let regs = unsafe { &mut *regs };
    state.dispatch(regs)
}

/// An installed site.
///
/// Neither the stub nor the state it dispatches to is ever freed: a thread
/// may have entered the stub right before the site was restored and still be
/// on its way through the epilog or the cave.
pub struct BreakpointSite {
    patch: CodePatch,
    state: &'static SiteState,
}

impl BreakpointSite {
    /// The number of bytes overwritten at the site.
    pub fn len(&self) -> usize {
        self.patch.len()
    }

    /// Where the relocated original instructions start.
    pub fn cave_addr(&self) -> u32 {
        self.patch.cave_addr()
    }

    /// Where the capture stub starts.
    pub fn stub_addr(&self) -> usize {
        self.patch.stub_addr()
    }

    /// Runs the site's handlers as its trap would.
    pub fn dispatch(&self, regs: &mut Registers) -> i32 {
        self.state.dispatch(regs)
    }
}

/// What an apply call did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Newly installed sites.
    pub applied: Vec<usize>,
    /// Sites that were installed already.
    pub unchanged: Vec<usize>,
    /// Sites left out, by their configured key.
    pub skipped: Vec<(String, HookError)>,
}

/// Parses a site key: `0x`-prefixed hex or decimal.
pub fn parse_addr(key: &str) -> Option<usize> {
    let key = key.trim();
    match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => key.parse().ok(),
    }
    .filter(|addr| *addr != 0)
}

/// The installed breakpoint sites of a process.
pub struct Breakpoints {
    registry: HandlerRegistry,
    mem: Arc<dyn Memory>,
    options: HookOptions,
    sites: RwLock<HashMap<usize, BreakpointSite>>,
}

impl Breakpoints {
    /// Create an empty set of sites.
    pub fn new(registry: HandlerRegistry, mem: Arc<dyn Memory>, options: HookOptions) -> Self {
        Self {
            registry,
            mem,
            options,
            sites: RwLock::new(HashMap::new()),
        }
    }

    /// The handler registry sites are resolved against.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Installs every site of a breakpoint configuration object.
    ///
    /// A site with an unknown handler, a malformed operand or a bad address is
    /// skipped and reported; the other sites are still installed. Sites that
    /// are installed already are left alone.
    ///
    /// # Safety
    ///
    /// Every address must point to code at an instruction boundary that
    /// tolerates the trap, see [`CodePatch::prepare`].
    pub unsafe fn apply(&self, breakpoints: &Value) -> Result<ApplyReport, HookError> {
        let obj = breakpoints
            .as_object()
            .ok_or_else(|| HookError::InvalidConfig("breakpoints must be an object".into()))?;
        let mut report = ApplyReport::default();
        for (key, site) in obj {
            let ret = parse_addr(key)
                .ok_or_else(|| HookError::InvalidConfig(format!("bad address `{key}`")))
                .and_then(|addr| Ok((addr, BreakpointConfig::from_json(site)?)))
                .and_then(|(addr, config)| Ok((addr, unsafe { self.apply_site(addr, &config) }?)));
            match ret {
                Ok((addr, true)) => report.applied.push(addr),
                Ok((addr, false)) => report.unchanged.push(addr),
                Err(e) => {
                    warn!("skipping breakpoint {key}: {e}");
                    report.skipped.push((key.clone(), e));
                }
            }
        }
        info!(
            "{} breakpoints applied, {} skipped",
            report.applied.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Installs one site. Returns false if the site was installed already.
    ///
    /// # Safety
    ///
    /// See [`Breakpoints::apply`].
    pub unsafe fn apply_site(&self, addr: usize, config: &BreakpointConfig) -> Result<bool, HookError> {
        let mut sites = self.sites.write().map_err(|_| HookError::InvalidParameter)?;
        if sites.contains_key(&addr) {
            debug!("breakpoint at {addr:#x} already installed");
            return Ok(false);
        }
        let chain = HandlerChain::resolve(config, &self.registry)?;
        let state = Box::new(SiteState {
            addr,
            chain,
            mem: self.mem.clone(),
            cave_addr: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
        });
        let user_data = &*state as *const SiteState as usize;
        let mut patch = unsafe {
            CodePatch::prepare(addr, config.cavesize, breakpoint_process, user_data, self.options)
        }?;
        state.cave_addr.store(patch.cave_addr(), Ordering::Release);
        unsafe { patch.commit() }?;
        let state = Box::leak(state);
        sites.insert(addr, BreakpointSite { patch, state });
        debug!("breakpoint at {addr:#x} installed");
        Ok(true)
    }

    /// Whether a site is installed at `addr`.
    pub fn is_installed(&self, addr: usize) -> bool {
        self.sites
            .read()
            .map(|sites| sites.contains_key(&addr))
            .unwrap_or(false)
    }

    /// Runs the handlers of the site at `addr` on `regs`, as its trap would.
    /// `None` if no site is installed there.
    pub fn dispatch_at(&self, addr: usize, regs: &mut Registers) -> Option<i32> {
        let sites = self.sites.read().ok()?;
        Some(sites.get(&addr)?.dispatch(regs))
    }

    /// Restores the site at `addr` and returns once no trap is running its
    /// handlers. The stub and handler state stay alive.
    pub fn remove(&self, addr: usize) -> Result<(), HookError> {
        let mut sites = self.sites.write().map_err(|_| HookError::InvalidParameter)?;
        let site = sites.get_mut(&addr).ok_or(HookError::NotInstalled(addr))?;
        site.patch.restore()?;
        if let Some(site) = sites.remove(&addr) {
            wait_quiescent(&site);
        }
        debug!("breakpoint at {addr:#x} removed");
        Ok(())
    }

    /// Removes every site. Returns the first error, after trying them all.
    pub fn remove_all(&self) -> Result<(), HookError> {
        let addrs: Vec<usize> = match self.sites.read() {
            Ok(sites) => sites.keys().copied().collect(),
            Err(_) => return Err(HookError::InvalidParameter),
        };
        let mut first_err = None;
        for addr in addrs {
            if let Err(e) = self.remove(addr) {
                warn!("can't remove breakpoint at {addr:#x}: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn wait_quiescent(site: &BreakpointSite) {
    while site.state.in_flight.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
}

impl Drop for Breakpoints {
    fn drop(&mut self) {
        self.remove_all().unwrap_or_default();
    }
}
