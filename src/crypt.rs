//! Path hashing and file encryption of the supported titles.
//!
//! The strategy is picked once from the [`Title`]; nothing downstream
//! branches on the title again.

use std::fmt;

use serde::Deserialize;

use crate::err::HookError;

/// Maps a logical file path to the hash the game identifies the file by.
pub trait FileHash: Send + Sync {
    /// Hashes `path`.
    fn hash(&self, path: &str) -> u32;
}

/// Where a cipher stands in a file: the byte offset, and the chaining word
/// for ciphers that have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherPos {
    /// The file offset of the next byte.
    pub offset: usize,
    /// The chaining word, unused by ciphers without chaining.
    pub aux: u32,
}

/// The file encryption of a title.
pub trait CryptoStrategy: Send + Sync {
    /// Turns the raw key words the game stores into the key used by
    /// `encrypt` and `decrypt`.
    fn derive_key(&self, raw: [u32; 4]) -> [u32; 4];

    /// The position at the start of a file.
    fn start(&self, key: &[u32; 4]) -> CipherPos;

    /// The position at `offset`, if it can be known without the bytes
    /// before it.
    fn seek(&self, key: &[u32; 4], offset: usize) -> Option<CipherPos> {
        (offset == 0).then(|| self.start(key))
    }

    /// Whether bytes at `pos` can be processed. A chained cipher can't resume
    /// in the middle of a word.
    fn resumable(&self, pos: &CipherPos) -> bool {
        let _ = pos;
        true
    }

    /// Decrypts `buf`, which sits at `pos` in the file, and advances `pos`.
    fn decrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos);

    /// Encrypts `buf`, which sits at `pos` in the file, and advances `pos`.
    fn encrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos);

    /// Decrypts a buffer starting at file offset 0 in place.
    fn decrypt(&self, buf: &mut [u8], key: &[u32; 4]) {
        self.decrypt_at(buf, key, &mut self.start(key));
    }

    /// Encrypts a buffer starting at file offset 0 in place.
    fn encrypt(&self, buf: &mut [u8], key: &[u32; 4]) {
        self.encrypt_at(buf, key, &mut self.start(key));
    }
}

const FNV_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

// The games hash lowercase paths with backslashes.
fn normalized(path: &str) -> impl Iterator<Item = u8> + '_ {
    path.bytes().map(|b| match b {
        b'/' => b'\\',
        _ => b.to_ascii_lowercase(),
    })
}

fn key_bytes(key: &[u32; 4]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (chunk, k) in bytes.chunks_exact_mut(4).zip(key) {
        chunk.copy_from_slice(&k.to_le_bytes());
    }
    bytes
}

/// Houjuu / Shinkirou era: multiply-then-xor hashing and a plain repeating
/// xor with the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Th135;

impl FileHash for Th135 {
    fn hash(&self, path: &str) -> u32 {
        normalized(path).fold(FNV_BASIS, |h, c| h.wrapping_mul(FNV_PRIME) ^ u32::from(c))
    }
}

impl CryptoStrategy for Th135 {
    fn derive_key(&self, raw: [u32; 4]) -> [u32; 4] {
        raw
    }

    fn start(&self, _key: &[u32; 4]) -> CipherPos {
        CipherPos { offset: 0, aux: 0 }
    }

    fn seek(&self, _key: &[u32; 4], offset: usize) -> Option<CipherPos> {
        Some(CipherPos { offset, aux: 0 })
    }

    fn decrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos) {
        let kb = key_bytes(key);
        for (b, k) in buf.iter_mut().zip(kb.iter().cycle().skip(pos.offset % 16)) {
            *b ^= k;
        }
        pos.offset += buf.len();
    }

    fn encrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos) {
        self.decrypt_at(buf, key, pos)
    }
}

/// Later titles: xor-then-multiply hashing, negated key words, and a cipher
/// chaining each dword with the previous ciphertext dword.
#[derive(Debug, Default, Clone, Copy)]
pub struct Th145;

impl FileHash for Th145 {
    fn hash(&self, path: &str) -> u32 {
        normalized(path).fold(FNV_BASIS, |h, c| (h ^ u32::from(c)).wrapping_mul(FNV_PRIME))
    }
}

impl Th145 {
    fn xor_tail(tail: &mut [u8], key: &[u32; 4], first: usize, aux: u32) {
        for (i, b) in tail.iter_mut().enumerate() {
            let mask = (key[(first + i / 4) % 4] ^ aux).to_le_bytes();
            *b ^= mask[i % 4];
        }
    }
}

impl CryptoStrategy for Th145 {
    fn derive_key(&self, raw: [u32; 4]) -> [u32; 4] {
        raw.map(u32::wrapping_neg)
    }

    fn start(&self, key: &[u32; 4]) -> CipherPos {
        CipherPos {
            offset: 0,
            aux: key[0],
        }
    }

    fn resumable(&self, pos: &CipherPos) -> bool {
        pos.offset % 4 == 0
    }

    fn decrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos) {
        let mut aux = pos.aux;
        let mut n = pos.offset / 4;
        let mut words = buf.chunks_exact_mut(4);
        for w in &mut words {
            let c = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            w.copy_from_slice(&(c ^ key[n % 4] ^ aux).to_le_bytes());
            aux = c;
            n += 1;
        }
        Self::xor_tail(words.into_remainder(), key, n, aux);
        pos.aux = aux;
        pos.offset += buf.len();
    }

    fn encrypt_at(&self, buf: &mut [u8], key: &[u32; 4], pos: &mut CipherPos) {
        let mut aux = pos.aux;
        let mut n = pos.offset / 4;
        let mut words = buf.chunks_exact_mut(4);
        for w in &mut words {
            let p = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            let c = p ^ key[n % 4] ^ aux;
            w.copy_from_slice(&c.to_le_bytes());
            aux = c;
            n += 1;
        }
        Self::xor_tail(words.into_remainder(), key, n, aux);
        pos.aux = aux;
        pos.offset += buf.len();
    }
}

/// The game a session runs in, from its id such as `"th145"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Title {
    /// th135
    Th135,
    /// th145
    Th145,
    /// A title after th145, which shares its file format.
    Future(u32),
}

impl Title {
    /// The encryption of the title's archives.
    pub fn crypto(self) -> &'static dyn CryptoStrategy {
        match self {
            Title::Th135 => &Th135,
            Title::Th145 | Title::Future(_) => &Th145,
        }
    }

    /// The path hash of the title's archives.
    pub fn hasher(self) -> &'static dyn FileHash {
        match self {
            Title::Th135 => &Th135,
            Title::Th145 | Title::Future(_) => &Th145,
        }
    }
}

impl TryFrom<&str> for Title {
    type Error = HookError;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        let num = id
            .strip_prefix("th")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| HookError::InvalidConfig(format!("unknown game `{id}`")))?;
        match num {
            135 => Ok(Title::Th135),
            145 => Ok(Title::Th145),
            n if n > 145 => Ok(Title::Future(n)),
            _ => Err(HookError::InvalidConfig(format!("unsupported game `{id}`"))),
        }
    }
}

impl TryFrom<String> for Title {
    type Error = HookError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Title::try_from(id.as_str())
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Title::Th135 => f.write_str("th135"),
            Title::Th145 => f.write_str("th145"),
            Title::Future(n) => write!(f, "th{n}"),
        }
    }
}
