//! Substitution of the files a game reads from its encrypted archives.
//!
//! The game identifies archive files by a hash of their path. A header trap
//! tells which hash is about to be read and with which key; a read trap
//! then patches the bytes the game just read and re-encrypts them, so the
//! game's own decryption yields the replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use log::{debug, info, trace, warn};
use serde_json::Value;

use crate::breakpoint::{BreakpointInfo, HandlerRegistry};
use crate::crypt::{CipherPos, CryptoStrategy, FileHash, Title};
use crate::err::HookError;
use crate::x86::Registers;

pub mod fragment;
pub use fragment::BufferedRead;


// MAX_PATH
const MAX_PATH_LEN: usize = 260;

/// Replacement content for one file.
#[derive(Debug)]
pub struct FileReplacement {
    /// The path the content was found under.
    pub name: String,
    /// The whole new file, in plain text.
    pub buffer: Option<Vec<u8>>,
    /// A diff against the original file, applied by [`PatchStack::apply_patch`].
    pub patch: Option<Value>,
    encrypted: OnceLock<Vec<u8>>,
}

impl FileReplacement {
    /// Replaces the whole file.
    pub fn with_buffer(name: impl Into<String>, buffer: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            buffer: Some(buffer),
            patch: None,
            encrypted: OnceLock::new(),
        }
    }

    /// Patches the original file.
    pub fn with_patch(name: impl Into<String>, patch: Value) -> Self {
        Self {
            name: name.into(),
            buffer: None,
            patch: Some(patch),
            encrypted: OnceLock::new(),
        }
    }

    /// Whether there is anything to substitute.
    pub fn has_content(&self) -> bool {
        self.buffer.is_some() || self.patch.is_some()
    }

    /// The replacement buffer as the game's cipher would have produced it.
    /// Encrypted on first use.
    pub fn encrypted_image(&self, hooks: &CipherHooks<'_>) -> Option<&[u8]> {
        let buffer = self.buffer.as_ref()?;
        let image = self.encrypted.get_or_init(|| {
            let mut image = buffer.clone();
            hooks.encrypt_file(&mut image);
            image
        });
        Some(image)
    }
}

/// Looks up replacement content by logical path.
pub trait PatchStack: Send + Sync {
    /// The replacement of `path`, if any patch provides one.
    fn file_rep(&self, path: &str) -> Option<FileReplacement>;

    /// Applies `rep`'s diff to a decrypted fragment of the original file.
    /// `offset` is the file offset of the fragment's first byte.
    fn apply_patch(&self, rep: &FileReplacement, fragment: &mut [u8], offset: usize);
}

/// The cipher steps around an in-place patch, positioned in the file.
///
/// Decryption follows the game's original bytes and encryption follows the
/// bytes handed back, so each side keeps its own position.
pub struct CipherHooks<'a> {
    crypto: &'a dyn CryptoStrategy,
    key: [u32; 4],
    read_pos: CipherPos,
    write_pos: CipherPos,
}

impl<'a> CipherHooks<'a> {
    /// Hooks for a derived key, at the start of the file.
    pub fn new(crypto: &'a dyn CryptoStrategy, key: [u32; 4]) -> Self {
        let start = crypto.start(&key);
        Self::resume(crypto, key, start, start)
    }

    /// Hooks continuing where an earlier read left off.
    pub fn resume(
        crypto: &'a dyn CryptoStrategy,
        key: [u32; 4],
        read_pos: CipherPos,
        write_pos: CipherPos,
    ) -> Self {
        Self {
            crypto,
            key,
            read_pos,
            write_pos,
        }
    }

    /// Moves both sides to `offset`. A read right after the previous one
    /// keeps the chaining state; otherwise the cipher has to be able to seek.
    /// Returns false if the cipher can't be positioned there.
    pub fn seek(&mut self, offset: usize) -> bool {
        if self.read_pos.offset == offset
            && self.write_pos.offset == offset
            && self.crypto.resumable(&self.read_pos)
        {
            return true;
        }
        match self.crypto.seek(&self.key, offset) {
            Some(pos) => {
                self.read_pos = pos;
                self.write_pos = pos;
                true
            }
            None => false,
        }
    }

    /// The read and write positions.
    pub fn positions(&self) -> (CipherPos, CipherPos) {
        (self.read_pos, self.write_pos)
    }

    /// Decrypts bytes just read by the game.
    pub fn post_read(&mut self, buf: &mut [u8]) {
        self.crypto.decrypt_at(buf, &self.key, &mut self.read_pos);
    }

    /// Encrypts patched bytes before they go back to the game.
    pub fn post_patch(&mut self, buf: &mut [u8]) {
        self.crypto.encrypt_at(buf, &self.key, &mut self.write_pos);
    }

    /// Encrypts a whole file, independent of the positions.
    pub fn encrypt_file(&self, buf: &mut [u8]) {
        self.crypto.encrypt(buf, &self.key);
    }
}

/// Copies or patches replacement content into the game's read buffer.
pub trait FragmentedRead: Send + Sync {
    /// Handles one read trap. Returns whether the code cave should run.
    fn read(
        &self,
        regs: &mut Registers,
        info: &BreakpointInfo<'_>,
        rep: &FileReplacement,
        hooks: &mut CipherHooks<'_>,
        patches: &dyn PatchStack,
    ) -> bool;
}

/// A file the game opened.
#[derive(Debug)]
pub struct FileHeader {
    /// The path hash.
    pub hash: u32,
    /// The derived key.
    pub key: [u32; 4],
    /// The path the hash resolved to.
    pub path: String,
    /// The content to substitute, if any.
    pub rep: Option<FileReplacement>,
    /// Where the last read left the decryption.
    pub read_pos: CipherPos,
    /// Where the last read left the encryption.
    pub write_pos: CipherPos,
}

impl FileHeader {
    /// The name the replacement is known by. Differs from `path` after an
    /// extension fallback.
    pub fn visible_name(&self) -> Option<&str> {
        self.rep.as_ref().map(|r| r.name.as_str())
    }
}

/// Tracks the files a game opens and substitutes their content.
pub struct FileVirtualizer {
    hasher: &'static dyn FileHash,
    crypto: &'static dyn CryptoStrategy,
    patches: Arc<dyn PatchStack>,
    reader: Arc<dyn FragmentedRead>,
    fallbacks: HashMap<String, String>,
    names: RwLock<HashMap<u32, String>>,
    headers: Mutex<HashMap<u32, FileHeader>>,
    // file object address -> hash
    sessions: Mutex<HashMap<u32, u32>>,
}

/// The default extension fallbacks: a DDS texture may be replaced by a PNG.
pub fn default_fallbacks() -> HashMap<String, String> {
    HashMap::from([("dds".to_owned(), "png".to_owned())])
}

impl FileVirtualizer {
    /// Create a virtualizer for a title, reading with [`BufferedRead`].
    pub fn new(title: Title, patches: Arc<dyn PatchStack>) -> Self {
        Self {
            hasher: title.hasher(),
            crypto: title.crypto(),
            patches,
            reader: Arc::new(BufferedRead),
            fallbacks: default_fallbacks(),
            names: RwLock::new(HashMap::new()),
            headers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the read handler.
    pub fn with_reader(mut self, reader: Arc<dyn FragmentedRead>) -> Self {
        self.reader = reader;
        self
    }

    /// Replaces the extension fallback table. Keys and values are extensions
    /// without the dot.
    pub fn with_fallbacks(mut self, fallbacks: HashMap<String, String>) -> Self {
        self.fallbacks = fallbacks
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self
    }

    /// Adds `path` to the reverse table. Returns its hash.
    pub fn register_filename(&self, path: &str) -> u32 {
        let hash = self.hasher.hash(path);
        if let Ok(mut names) = self.names.write() {
            names.entry(hash).or_insert_with(|| path.to_owned());
        }
        hash
    }

    /// Registers every path of a JSON array. Returns how many were added.
    pub fn load_file_list(&self, list: &Value) -> Result<usize, HookError> {
        let list = list
            .as_array()
            .ok_or_else(|| HookError::InvalidConfig("the file list must be an array".into()))?;
        let mut cnt = 0;
        for path in list {
            match path.as_str() {
                Some(path) => {
                    self.register_filename(path);
                    cnt += 1;
                }
                None => warn!("ignoring file list entry {path}"),
            }
        }
        info!("{cnt} file names registered");
        Ok(cnt)
    }

    /// The path registered for `hash`.
    pub fn path_for_hash(&self, hash: u32) -> Option<String> {
        self.names.read().ok()?.get(&hash).cloned()
    }

    fn lookup(&self, path: &str) -> Option<FileReplacement> {
        self.patches.file_rep(path).filter(FileReplacement::has_content)
    }

    fn fallback_path(&self, path: &str) -> Option<String> {
        let dir_end = path.rfind(['/', '\\']).map_or(0, |i| i + 1);
        let dot = dir_end + path[dir_end..].rfind('.')?;
        let alt = self.fallbacks.get(&path[dot + 1..].to_ascii_lowercase())?;
        Some(format!("{}.{}", &path[..dot], alt))
    }

    /// Records that the game opened the file hashed `hash` with the raw key
    /// `raw_key`. Returns whether replacement content is bound to it.
    ///
    /// If nothing replaces the file and its extension has a fallback, the
    /// fallback's replacement is moved into this file's header under the
    /// fallback path.
    pub fn open_file(&self, hash: u32, raw_key: [u32; 4]) -> bool {
        let Some(path) = self.path_for_hash(hash) else {
            trace!("unknown file hash {hash:#010x}");
            return false;
        };
        let rep = self.lookup(&path).or_else(|| {
            let alt = self.fallback_path(&path)?;
            self.register_filename(&alt);
            let mut rep = self.lookup(&alt)?;
            debug!("{path} is replaced by {alt}");
            rep.name = alt;
            Some(rep)
        });
        let bound = rep.is_some();
        let key = self.crypto.derive_key(raw_key);
        let start = self.crypto.start(&key);
        let header = FileHeader {
            hash,
            key,
            path,
            rep,
            read_pos: start,
            write_pos: start,
        };
        match self.headers.lock() {
            Ok(mut headers) => {
                headers.insert(hash, header);
                bound
            }
            Err(_) => false,
        }
    }

    /// Runs `f` on the header of `hash`.
    pub fn with_header<R>(&self, hash: u32, f: impl FnOnce(&mut FileHeader) -> R) -> Option<R> {
        let mut headers = self.headers.lock().ok()?;
        headers.get_mut(&hash).map(f)
    }

    /// Forgets the header of `hash`.
    pub fn clear(&self, hash: u32) {
        if let Ok(mut headers) = self.headers.lock() {
            headers.remove(&hash);
        }
    }

    /// Associates a file object of the game with a hash. A header left
    /// without sessions by the rebinding is forgotten.
    pub fn bind_session(&self, file: u32, hash: u32) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if let Some(old) = sessions.insert(file, hash) {
            if old != hash && !sessions.values().any(|h| *h == old) {
                self.clear(old);
            }
        }
    }

    /// Forgets every header no file object is bound to.
    pub fn drop_unbound_headers(&self) {
        let Ok(sessions) = self.sessions.lock() else {
            return;
        };
        if let Ok(mut headers) = self.headers.lock() {
            headers.retain(|hash, _| sessions.values().any(|h| h == hash));
        }
    }

    /// The hash bound to a file object.
    pub fn session_hash(&self, file: u32) -> Option<u32> {
        self.sessions.lock().ok()?.get(&file).copied()
    }

    /// Ends a file object's session. The header goes too, unless another
    /// file object still reads the same hash.
    pub fn end_session(&self, file: u32) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let Some(hash) = sessions.remove(&file) else {
            return;
        };
        if !sessions.values().any(|h| *h == hash) {
            self.clear(hash);
        }
    }

    /// Handles a read of the file hashed `hash`. Without a header or
    /// replacement content the read passes through untouched.
    pub fn read(&self, regs: &mut Registers, info: &BreakpointInfo<'_>, hash: u32) -> bool {
        let Ok(mut headers) = self.headers.lock() else {
            return info.cave_exec();
        };
        let Some(header) = headers.get_mut(&hash) else {
            trace!("no header for {hash:#010x}");
            return info.cave_exec();
        };
        let Some(rep) = header.rep.as_ref().filter(|r| r.has_content()) else {
            trace!("nothing to patch for {hash:#010x}");
            return info.cave_exec();
        };
        let mut hooks =
            CipherHooks::resume(self.crypto, header.key, header.read_pos, header.write_pos);
        let info = info.with("file_name", rep.name.as_str());
        let cave = self.reader.read(regs, &info, rep, &mut hooks, &*self.patches);
        (header.read_pos, header.write_pos) = hooks.positions();
        cave
    }

    fn file_header_bp(&self, regs: &mut Registers, info: &BreakpointInfo<'_>) -> bool {
        let hash = info.immediate(regs, "file_hash").unwrap_or(0) as u32;
        let Some(key_addr) = info.pointer(regs, "file_key") else {
            return info.cave_exec();
        };
        if hash == 0 {
            return info.cave_exec();
        }
        let mem = info.memory();
        let mut raw_key = [0u32; 4];
        for (i, k) in raw_key.iter_mut().enumerate() {
            match mem.read_u32(key_addr.wrapping_add(4 * i as u32)) {
                Some(v) => *k = v,
                None => return info.cave_exec(),
            }
        }
        match info.pointer(regs, "file") {
            Some(file) => self.bind_session(file, hash),
            // without file objects only the latest header is live
            None => self.drop_unbound_headers(),
        }
        self.open_file(hash, raw_key);
        info.cave_exec()
    }

    fn file_name_bp(&self, regs: &mut Registers, info: &BreakpointInfo<'_>) -> bool {
        if let Some(path) = info
            .pointer(regs, "file_name")
            .and_then(|addr| info.memory().read_cstr(addr, MAX_PATH_LEN))
        {
            self.register_filename(&path);
        }
        info.cave_exec()
    }

    fn read_file_bp(&self, regs: &mut Registers, info: &BreakpointInfo<'_>) -> bool {
        let file = info.pointer(regs, "file");
        let hash = match info.immediate(regs, "hash").filter(|h| *h != 0) {
            Some(h) => {
                let h = h as u32;
                if let Some(file) = file {
                    self.bind_session(file, h);
                }
                Some(h)
            }
            None => file.and_then(|f| self.session_hash(f)),
        };
        match hash {
            Some(hash) => self.read(regs, info, hash),
            None => info.cave_exec(),
        }
    }

    fn close_file_bp(&self, regs: &mut Registers, info: &BreakpointInfo<'_>) -> bool {
        if let Some(file) = info.pointer(regs, "file") {
            self.end_session(file);
        }
        info.cave_exec()
    }

    /// Registers the file breakpoints:
    ///
    /// * `th135_file_header` with `file_hash`, `file_key` and optionally
    ///   `file`, the game's file object. Without `file`, opening a file
    ///   forgets the headers no file object is bound to.
    /// * `th135_file_name` with `file_name`, a C string.
    /// * `th135_read_file` with `hash` or `file`, plus the parameters of the
    ///   read handler.
    /// * `th135_close_file` with `file`.
    pub fn register_handlers(self: &Arc<Self>, registry: &mut HandlerRegistry) {
        let this = self.clone();
        registry.register("th135_file_header", move |regs, info| this.file_header_bp(regs, info));
        let this = self.clone();
        registry.register("th135_file_name", move |regs, info| this.file_name_bp(regs, info));
        let this = self.clone();
        registry.register("th135_read_file", move |regs, info| this.read_file_bp(regs, info));
        let this = self.clone();
        registry.register("th135_close_file", move |regs, info| this.close_file_bp(regs, info));
    }
}
