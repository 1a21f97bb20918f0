//! Seeds: auto-seeding, per-key derivation and RNG construction.

use rand::rngs::{StdRng, ThreadRng};
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::core::context::Context;

/// An RNG handle that can be shared between a caller and a render call.
pub type SharedRng = Rc<RefCell<StdRng>>;

/// A seed request: generate one, use a fixed string, or draw from an RNG.
#[derive(Clone, Default)]
pub enum Seed {
    /// Draw a fresh seed from ambient randomness.
    #[default]
    Auto,
    /// A fixed, reproducible seed string.
    Fixed(String),
    /// An RNG whose internal state already encodes history.
    Rng(SharedRng),
}

impl Seed {
    /// Wrap an RNG so it can be handed to `render_story` repeatedly.
    pub fn from_rng(rng: StdRng) -> Self {
        Seed::Rng(Rc::new(RefCell::new(rng)))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Seed::Fixed(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seed::Auto => write!(f, "Seed::Auto"),
            Seed::Fixed(s) => write!(f, "Seed::Fixed({:?})", s),
            Seed::Rng(_) => write!(f, "Seed::Rng(..)"),
        }
    }
}

impl From<&str> for Seed {
    fn from(s: &str) -> Self {
        Seed::Fixed(s.to_string())
    }
}

impl From<String> for Seed {
    fn from(s: String) -> Self {
        Seed::Fixed(s)
    }
}

impl From<Option<String>> for Seed {
    fn from(s: Option<String>) -> Self {
        s.map(Seed::Fixed).unwrap_or_default()
    }
}

/// Generate a 32-character lowercase hex seed from `rng`'s own randomness.
pub fn make_seed<R: Rng + ?Sized>(rng: &mut R) -> String {
    let sample: f64 = rng.gen();
    let digest = Sha256::digest(sample.to_string().as_bytes());
    hex::encode(&digest[..16])
}

/// Normalize `seed` into the context as a fixed string.
///
/// `Auto` draws from ambient randomness; an RNG handle is advanced once to
/// derive a string, so the context always ends up holding `Seed::Fixed`.
pub fn set_seed(context: &Context, seed: Seed) {
    let fixed = match seed {
        Seed::Auto => make_seed(&mut rand::thread_rng()),
        Seed::Rng(rng) => make_seed(&mut *rng.borrow_mut()),
        Seed::Fixed(s) => s,
    };
    context.set_seed(Seed::Fixed(fixed));
}

/// Return the context's seed, materializing it on first read.
///
/// When a `key` is present the result is `"{seed}-{key}"`; the stored base
/// seed is left untouched.
pub fn get_seed(context: &Context) -> String {
    let base = context.materialize_seed();
    match context.key() {
        Some(key) => format!("{}-{}", base, key),
        None => base,
    }
}

/// Build the RNG for a seed: ambient for `Auto`, the same handle for `Rng`,
/// and a fresh deterministic generator for a fixed string.
pub fn get_rng(seed: &Seed) -> SeedRng {
    match seed {
        Seed::Auto => SeedRng::Ambient(rand::thread_rng()),
        Seed::Rng(rng) => SeedRng::Shared(Rc::clone(rng)),
        Seed::Fixed(s) => SeedRng::Owned(rng_from_str(s)),
    }
}

fn rng_from_str(seed: &str) -> StdRng {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    StdRng::from_seed(bytes)
}

/// The random source handed out by [`get_rng`].
pub enum SeedRng {
    Ambient(ThreadRng),
    Shared(SharedRng),
    Owned(StdRng),
}

impl SeedRng {
    /// True when this source is the given shared handle.
    pub fn is_shared(&self, other: &SharedRng) -> bool {
        matches!(self, SeedRng::Shared(rng) if Rc::ptr_eq(rng, other))
    }
}

impl RngCore for SeedRng {
    fn next_u32(&mut self) -> u32 {
        match self {
            SeedRng::Ambient(rng) => rng.next_u32(),
            SeedRng::Shared(rng) => rng.borrow_mut().next_u32(),
            SeedRng::Owned(rng) => rng.next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            SeedRng::Ambient(rng) => rng.next_u64(),
            SeedRng::Shared(rng) => rng.borrow_mut().next_u64(),
            SeedRng::Owned(rng) => rng.next_u64(),
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self {
            SeedRng::Ambient(rng) => rng.fill_bytes(dest),
            SeedRng::Shared(rng) => rng.borrow_mut().fill_bytes(dest),
            SeedRng::Owned(rng) => rng.fill_bytes(dest),
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        match self {
            SeedRng::Ambient(rng) => rng.try_fill_bytes(dest),
            SeedRng::Shared(rng) => rng.borrow_mut().try_fill_bytes(dest),
            SeedRng::Owned(rng) => rng.try_fill_bytes(dest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_seed_is_32_hex_chars() {
        let mut rng = StdRng::seed_from_u64(7);
        let seed = make_seed(&mut rng);
        assert_eq!(seed.len(), 32);
        assert!(seed.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn make_seed_follows_rng_state() {
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        assert_eq!(make_seed(&mut rng1), make_seed(&mut rng2));
        assert_ne!(make_seed(&mut rng1), make_seed(&mut StdRng::seed_from_u64(8)));
    }

    #[test]
    fn set_seed_stores_fixed_string() {
        let ctx = Context::new();
        set_seed(&ctx, Seed::from("testing"));
        assert_eq!(ctx.seed().as_str(), Some("testing"));
    }

    #[test]
    fn set_seed_generates_when_auto() {
        let ctx = Context::new();
        set_seed(&ctx, Seed::Auto);
        assert_eq!(ctx.seed().as_str().map(str::len), Some(32));
    }

    #[test]
    fn set_seed_derives_string_from_rng() {
        let ctx1 = Context::new();
        let ctx2 = Context::new();
        set_seed(&ctx1, Seed::from_rng(StdRng::seed_from_u64(3)));
        set_seed(&ctx2, Seed::from_rng(StdRng::seed_from_u64(3)));
        assert_eq!(ctx1.seed().as_str(), ctx2.seed().as_str());
        assert_eq!(ctx1.seed().as_str().map(str::len), Some(32));
    }

    #[test]
    fn get_seed_appends_key_without_mutating_base() {
        let ctx = Context::with_seed("base");
        ctx.set_key(Some("Name".to_string()));
        assert_eq!(get_seed(&ctx), "base-Name");
        assert_eq!(ctx.seed().as_str(), Some("base"));

        ctx.set_key(None);
        assert_eq!(get_seed(&ctx), "base");
    }

    #[test]
    fn get_seed_materializes_missing_seed() {
        let ctx = Context::new();
        let first = get_seed(&ctx);
        assert_eq!(first.len(), 32);
        assert_eq!(get_seed(&ctx), first);
    }

    #[test]
    fn get_rng_same_string_same_sequence() {
        let mut a = get_rng(&Seed::from("foo"));
        let mut b = get_rng(&Seed::from("foo"));
        let xs: Vec<u32> = (0..5).map(|_| a.gen_range(0..1000)).collect();
        let ys: Vec<u32> = (0..5).map(|_| b.gen_range(0..1000)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn get_rng_different_strings_differ() {
        let mut a = get_rng(&Seed::from("foo"));
        let mut b = get_rng(&Seed::from("bar"));
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn get_rng_returns_shared_handle_as_is() {
        let shared: SharedRng = Rc::new(RefCell::new(StdRng::seed_from_u64(1)));
        let rng = get_rng(&Seed::Rng(Rc::clone(&shared)));
        assert!(rng.is_shared(&shared));
    }

    #[test]
    fn get_rng_auto_is_ambient() {
        assert!(matches!(get_rng(&Seed::Auto), SeedRng::Ambient(_)));
    }
}
