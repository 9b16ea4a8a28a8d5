//! Finds the files of a BitTorrent payload on the local filesystem after
//! they were moved or renamed, proving each match by piece hash.

pub mod bencode;
pub mod cache;
pub mod config;
pub mod events;
pub mod finder;
pub mod metafile;
pub mod overlap;
pub mod payload;
pub mod search;

pub use cache::{
    CacheEntry, CacheError, CacheStore, ContentDirectoryCache, ContentIndex, JsonFileStore,
    MemoryStore,
};
pub use config::{Config, ConfigError};
pub use events::{EventSink, FinderEvent, RecordingSink, TracingSink};
pub use finder::{find_matches, FinderError, LocalFileFinder};
pub use metafile::{create_metafile, MetafileError};
pub use payload::{Payload, PayloadFile, PayloadPiece};
