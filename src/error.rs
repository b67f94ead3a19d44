//! Closed set of failures the engine's control API can return.
//!
//! `mix()` itself never fails: a malformed channel just falls silent. Errors
//! are for the control API (`load_pack`, `play`, SFX `play`, ...) where the
//! caller made a request the engine can't satisfy.

use std::fmt;

/// All ways a UMOD control-API call can fail.
///
/// This set is closed: adding a variant is a breaking change and the corpus
/// this crate is modeled on expects callers to exhaustively match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The pack's 4-byte magic did not read `UMOD`.
    BadMagic,
    /// The pack declares songs but zero patterns.
    SongsWithoutPatterns,
    /// The pack declares zero instruments.
    NoInstruments,
    /// A `mix`/`play` call was made before the engine's sample rate was set
    /// (this never happens through the public API, which takes the sample
    /// rate at construction; kept for parity with the closed error set).
    NotInitialized,
    /// A song or instrument index was out of range for the loaded pack.
    IndexOutOfRange,
    /// The SFX manager has no free or releasable channel.
    NoFreeChannel,
    /// The supplied SFX handle is stale (the channel has been reallocated).
    InvalidHandle,
    /// A state transition that isn't valid from the current state, e.g.
    /// pausing a song that isn't playing.
    InvalidState,
    /// A sample offset, or an internally computed playback period, fell
    /// outside what the mixer can safely play back. The channel is stopped
    /// as a side effect.
    BadOffset,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::BadMagic => "pack header magic is not 'UMOD'",
            Error::SongsWithoutPatterns => "pack declares songs but no patterns",
            Error::NoInstruments => "pack declares no instruments",
            Error::NotInitialized => "engine used before initialization",
            Error::IndexOutOfRange => "song, pattern or instrument index out of range",
            Error::NoFreeChannel => "no free or releasable channel available",
            Error::InvalidHandle => "SFX handle is stale or invalid",
            Error::InvalidState => "operation invalid in the current state",
            Error::BadOffset => "sample offset or period out of range, channel stopped",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
