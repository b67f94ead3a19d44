//! Handle-based SFX channel manager (`spec.md` §4.5).
//!
//! No direct teacher counterpart — `examples/Gnurou-awer/src/audio.rs`'s
//! `Mixer` trait plays samples by bare `u8` id with no stealing policy, so
//! the handle/stale-detection scheme here is built straight from `spec.md`
//! §3's `{counter<<16 | channel_index}` design and §4.5's channel-selection
//! rule, in the same "plain struct + inherent methods over a fixed-size
//! array" shape the mixer and song engine use.

use tracing::warn;

use crate::error::{Error, Result};
use crate::mixer::{Mixer, MOD_CHANNELS_MAX, SFX_CHANNELS};
use crate::pack::Pack;

/// Opaque handle to a playing SFX instance. `0` is reserved as invalid.
pub type SfxHandle = u32;

const INVALID_HANDLE: SfxHandle = 0;

/// How a `play` call should treat the instrument's own loop points.
pub use crate::mixer::LoopMode;

struct SfxChannel {
    /// Monotonically increasing, skips zero; the handle currently valid for
    /// this channel is `(counter << 16) | channel_index`.
    counter: u16,
    in_use: bool,
    released: bool,
    /// Instrument this channel was last `play`ed with (`spec.md` §3's SFX
    /// channel state), so `set_frequency_multiplier` doesn't need the caller
    /// to repeat it.
    instrument_ref: Option<u32>,
}

impl SfxChannel {
    fn new() -> Self {
        SfxChannel {
            counter: 0,
            in_use: false,
            released: false,
            instrument_ref: None,
        }
    }

    fn handle(&self, channel_index: usize) -> SfxHandle {
        ((self.counter as u32) << 16) | channel_index as u32
    }
}

/// Allocates and programs the mixer rows `MOD_CHANNELS_MAX..MIXER_CHANNELS_MAX`
/// reserved for sound effects.
pub struct SfxManager {
    channels: Vec<SfxChannel>,
    master_volume: u8,
}

impl SfxManager {
    pub fn new() -> Self {
        SfxManager {
            channels: (0..SFX_CHANNELS).map(|_| SfxChannel::new()).collect(),
            master_volume: 255,
        }
    }

    fn mixer_index(&self, local_index: usize) -> usize {
        MOD_CHANNELS_MAX + local_index
    }

    fn find_free(&self) -> Option<usize> {
        self.channels.iter().position(|c| !c.in_use)
    }

    fn find_released(&self) -> Option<usize> {
        self.channels.iter().position(|c| c.in_use && c.released)
    }

    fn next_counter(current: u16) -> u16 {
        let next = current.wrapping_add(1);
        if next == 0 {
            1
        } else {
            next
        }
    }

    /// Plays `instrument_index` on the first free channel, or steals the
    /// first released channel if none is free. Returns `Error::NoFreeChannel`
    /// if neither exists.
    pub fn play(
        &mut self,
        instrument_index: u32,
        loop_mode: LoopMode,
        sample_rate: u32,
        pack: &Pack,
        mixer: &mut Mixer,
    ) -> Result<SfxHandle> {
        let local_index = self
            .find_free()
            .or_else(|| self.find_released())
            .ok_or(Error::NoFreeChannel)?;

        let instrument = pack.instrument(instrument_index)?;
        let mixer_index = self.mixer_index(local_index);

        {
            let ch = mixer.channel_mut(mixer_index);
            ch.stop();
            ch.set_instrument(&instrument);
            ch.set_loop(loop_mode, &instrument);
            ch.set_volume(255);
            ch.set_panning(128);
        }

        let period = if instrument.default_frequency == 0 {
            return Err(Error::BadOffset);
        } else {
            ((sample_rate as u64) << 32) / instrument.default_frequency as u64
        };
        mixer.channel_mut(mixer_index).set_note_period(period)?;

        let slot = &mut self.channels[local_index];
        slot.counter = Self::next_counter(slot.counter);
        slot.in_use = true;
        slot.released = false;
        slot.instrument_ref = Some(instrument_index);

        Ok(slot.handle(local_index))
    }

    fn resolve(&self, handle: SfxHandle) -> Result<usize> {
        let local_index = (handle & 0xFFFF) as usize;
        if handle == INVALID_HANDLE || local_index >= self.channels.len() {
            return Err(Error::InvalidHandle);
        }
        let slot = &self.channels[local_index];
        if !slot.in_use || slot.handle(local_index) != handle {
            warn!(handle, "stale SFX handle");
            return Err(Error::InvalidHandle);
        }
        Ok(local_index)
    }

    pub fn stop(&mut self, handle: SfxHandle, mixer: &mut Mixer) -> Result<()> {
        let local_index = self.resolve(handle)?;
        mixer.channel_mut(self.mixer_index(local_index)).stop();
        let slot = &mut self.channels[local_index];
        slot.in_use = false;
        slot.released = false;
        slot.instrument_ref = None;
        Ok(())
    }

    /// A stale or unknown handle reports `false` rather than erroring: the
    /// original's `MixerChannelIsPlaying` has no concept of an invalid
    /// handle to reject, it just answers the query.
    pub fn is_playing(&self, handle: SfxHandle, mixer: &Mixer) -> Result<bool> {
        match self.resolve(handle) {
            Ok(local_index) => Ok(mixer.channel(self.mixer_index(local_index)).is_playing()),
            Err(_) => Ok(false),
        }
    }

    /// Marks the channel low-priority: it keeps playing, but a subsequent
    /// `play` call with no free channel may steal it.
    pub fn release(&mut self, handle: SfxHandle) -> Result<()> {
        let local_index = self.resolve(handle)?;
        self.channels[local_index].released = true;
        Ok(())
    }

    pub fn set_volume(&self, handle: SfxHandle, volume: u8, mixer: &mut Mixer) -> Result<()> {
        let local_index = self.resolve(handle)?;
        mixer.channel_mut(self.mixer_index(local_index)).set_volume(volume);
        Ok(())
    }

    pub fn set_panning(&self, handle: SfxHandle, pan: u8, mixer: &mut Mixer) -> Result<()> {
        let local_index = self.resolve(handle)?;
        mixer.channel_mut(self.mixer_index(local_index)).set_panning(pan);
        Ok(())
    }

    pub fn set_master_volume(&mut self, volume: u8, mixer: &mut Mixer) {
        self.master_volume = volume;
        for local_index in 0..self.channels.len() {
            mixer
                .channel_mut(self.mixer_index(local_index))
                .set_master_volume(volume);
        }
    }

    /// `multiplier` is 16.16 fixed point; `new_frequency = (multiplier *
    /// instrument.default_frequency) >> 16`, reprogrammed via the
    /// non-position-resetting period variant. The instrument is the one this
    /// handle was last `play`ed with, not a caller-supplied index.
    pub fn set_frequency_multiplier(
        &self,
        handle: SfxHandle,
        multiplier: u32,
        sample_rate: u32,
        pack: &Pack,
        mixer: &mut Mixer,
    ) -> Result<()> {
        let local_index = self.resolve(handle)?;
        let instrument_index = self.channels[local_index]
            .instrument_ref
            .ok_or(Error::InvalidHandle)?;
        let instrument = pack.instrument(instrument_index)?;
        let new_frequency = ((multiplier as u64 * instrument.default_frequency as u64) >> 16) as u32;
        if new_frequency == 0 {
            return Err(Error::BadOffset);
        }
        let period = ((sample_rate as u64) << 32) / new_frequency as u64;
        mixer
            .channel_mut(self.mixer_index(local_index))
            .set_note_period_porta(period)
    }
}

impl Default for SfxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::builder::{Instrument, PackBuilder};

    fn pack_with_instruments(n: usize) -> Vec<u8> {
        let mut builder = PackBuilder::new();
        for _ in 0..n {
            builder.add_instrument(Instrument {
                loop_start: 0,
                loop_end: 0,
                default_frequency: 8363,
                volume: 255,
                finetune: 0,
                data: vec![0; 32],
            });
        }
        builder.build()
    }

    #[test]
    fn scenario_b_handle_invalidation_by_stealing() {
        let data = pack_with_instruments(1);
        let pack = Pack::load(&data).unwrap();
        let mut mixer = Mixer::new();
        let mut sfx = SfxManager::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let h = sfx
                .play(0, LoopMode::Default, 32768, &pack, &mut mixer)
                .unwrap();
            assert_ne!(h, INVALID_HANDLE);
            handles.push(h);
        }

        sfx.release(handles[0]).unwrap();
        let h5 = sfx
            .play(0, LoopMode::Default, 32768, &pack, &mut mixer)
            .unwrap();
        assert_ne!(h5, INVALID_HANDLE);

        assert!(!sfx.is_playing(handles[0], &mixer).unwrap());
        assert!(sfx.is_playing(h5, &mixer).unwrap());

        assert_eq!(
            sfx.set_volume(handles[0], 128, &mut mixer),
            Err(Error::InvalidHandle)
        );
        assert_eq!(sfx.set_volume(h5, 128, &mut mixer), Ok(()));
    }

    #[test]
    fn no_free_channel_when_all_playing_and_none_released() {
        let data = pack_with_instruments(1);
        let pack = Pack::load(&data).unwrap();
        let mut mixer = Mixer::new();
        let mut sfx = SfxManager::new();

        for _ in 0..SFX_CHANNELS {
            sfx.play(0, LoopMode::Default, 32768, &pack, &mut mixer)
                .unwrap();
        }

        let result = sfx.play(0, LoopMode::Default, 32768, &pack, &mut mixer);
        assert_eq!(result, Err(Error::NoFreeChannel));
    }
}
