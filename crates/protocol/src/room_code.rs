//! Human-shareable room codes for relay rendezvous.
//!
//! A code is 3 to 6 words from a fixed 256-word list joined by hyphens,
//! e.g. `amber-falcon-river`. Each word carries 8 bits of entropy.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Default number of words in a generated code.
pub const DEFAULT_WORD_COUNT: usize = 3;

/// Minimum accepted word count.
pub const MIN_WORDS: usize = 3;

/// Maximum accepted word count.
pub const MAX_WORDS: usize = 6;

/// Sorted wordlist. Lookups use binary search.
pub const WORDLIST: [&str; 256] = [
    "acid", "acorn", "adobe", "agate", "alder", "almond", "alpine", "amber",
    "anchor", "anvil", "apple", "apricot", "arbor", "arctic", "arrow", "aspen",
    "atlas", "autumn", "badger", "bagel", "bamboo", "banjo", "barley", "basil",
    "basin", "beacon", "beaver", "beetle", "berry", "birch", "bison", "blossom",
    "bluff", "bonsai", "boulder", "bramble", "breeze", "bronze", "brook", "buckle",
    "bugle", "butter", "cabin", "cactus", "camel", "canal", "candle", "canoe",
    "canyon", "cargo", "carrot", "cashew", "castle", "cedar", "cello", "chalk",
    "cherry", "chess", "cider", "cinder", "citrus", "cloud", "clover", "coast",
    "cobalt", "cocoa", "comet", "copper", "coral", "cotton", "cougar", "coyote",
    "crane", "crater", "cricket", "crystal", "cypress", "daisy", "delta", "denim",
    "desert", "dingo", "dolphin", "dove", "dragon", "drift", "dune", "dusk",
    "eagle", "echo", "elm", "ember", "emerald", "falcon", "fennel", "fern",
    "fiddle", "fig", "flint", "forest", "fossil", "fox", "frost", "garnet",
    "gecko", "geyser", "ginger", "glacier", "glow", "goblet", "granite", "gravel",
    "grove", "gull", "harbor", "harvest", "hawk", "hazel", "heron", "hickory",
    "honey", "horizon", "husky", "iceberg", "igloo", "indigo", "iris", "island",
    "ivory", "jade", "jasmine", "jelly", "juniper", "kayak", "kelp", "kettle",
    "kiwi", "koala", "lagoon", "lantern", "larch", "lark", "lava", "lemon",
    "lilac", "lily", "lime", "linen", "lotus", "lynx", "magnet", "mango",
    "maple", "marble", "marsh", "meadow", "melon", "mesa", "mint", "mirror",
    "mocha", "mole", "moose", "moss", "nectar", "newt", "nickel", "nutmeg",
    "oak", "oasis", "ocean", "olive", "onyx", "orbit", "orchid", "otter",
    "owl", "oyster", "paddle", "panda", "pansy", "papaya", "parrot", "peach",
    "pearl", "pebble", "pecan", "pepper", "pine", "pixel", "plum", "polar",
    "pony", "poppy", "prairie", "prism", "puffin", "pumpkin", "quail", "quartz",
    "quill", "quince", "rabbit", "radish", "raven", "reef", "ridge", "river",
    "robin", "rocket", "rose", "ruby", "saddle", "saffron", "sage", "salmon",
    "sandal", "satin", "saturn", "scarlet", "sequoia", "shadow", "shell", "sierra",
    "silver", "sparrow", "spruce", "squid", "summit", "sunset", "swan", "tango",
    "teal", "thistle", "thunder", "tidal", "tiger", "timber", "topaz", "tulip",
    "tundra", "turtle", "valley", "velvet", "violet", "walnut", "walrus", "willow",
    "wizard", "wren", "yarrow", "yeti", "yucca", "zebra", "zephyr", "zinc",
];

/// Generates a random code of `word_count` words, clamped to
/// [`MIN_WORDS`]..=[`MAX_WORDS`].
pub fn generate(word_count: usize) -> String {
    let count = word_count.clamp(MIN_WORDS, MAX_WORDS);
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| WORDLIST[rng.gen_range(0..WORDLIST.len())])
        .collect::<Vec<_>>()
        .join("-")
}

/// Lowercases and trims a user-typed code.
pub fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

/// Format check only: word count and list membership.
///
/// Whether the room exists is decided by the relay.
pub fn validate(code: &str) -> bool {
    let code = normalize(code);
    let parts: Vec<&str> = code.split('-').collect();
    (MIN_WORDS..=MAX_WORDS).contains(&parts.len())
        && parts.iter().all(|p| WORDLIST.binary_search(p).is_ok())
}

/// Relay room identifier: first 16 bytes of SHA-256 of the normalized code,
/// hex-encoded.
pub fn room_id(code: &str) -> String {
    let digest = Sha256::digest(normalize(code).as_bytes());
    hex::encode(&digest[..16])
}
