//! Tracker-music and sound-effect playback engine (`spec.md` §1).
//!
//! [`Engine`] is the single entry point: load a pack, drive a song, fire SFX,
//! and pull mixed stereo frames. Everything underneath is plain data and
//! free functions passed the pieces they need, the same flat module shape
//! `examples/Gnurou-awer` uses for its VM/audio/gfx split.

mod error;
mod mixer;
mod mod_channel;
mod pack;
mod sfx;
mod song;
mod tables;

pub use error::{Error, Result};
pub use mixer::LoopMode;
pub use pack::Pack;
pub use sfx::SfxHandle;
pub use song::SongState;

use mixer::{Mixer, MOD_CHANNELS_MAX};
use mod_channel::ModChannel;
use sfx::SfxManager;
use song::Song;

/// Ties a loaded pack to the song scheduler, channel bank, mixer and SFX
/// manager that play it back. Borrows the pack's bytes for its whole
/// lifetime (`spec.md` §4.1: "No ownership transfer").
pub struct Engine<'a> {
    sample_rate: u32,
    pack: Option<Pack<'a>>,
    mixer: Mixer<'a>,
    channels: Vec<ModChannel>,
    song: Song,
    sfx: SfxManager,
}

impl<'a> Engine<'a> {
    /// Creates an engine with no pack loaded, mirroring the original's
    /// `UMOD_Init(sample_rate)`.
    pub fn new(sample_rate: u32) -> Self {
        Engine {
            sample_rate,
            pack: None,
            mixer: Mixer::new(),
            channels: (0..MOD_CHANNELS_MAX).map(ModChannel::new).collect(),
            song: Song::new(sample_rate),
            sfx: SfxManager::new(),
        }
    }

    /// Loads and validates `data` as a UMOD pack, replacing any previously
    /// loaded pack (and stopping whatever it was playing).
    pub fn load_pack(&mut self, data: &'a [u8]) -> Result<()> {
        let pack = Pack::load(data)?;
        self.song.stop(&mut self.mixer, &mut self.channels);
        self.pack = Some(pack);
        Ok(())
    }

    pub fn play_song(&mut self, song_index: u32) -> Result<()> {
        let pack = self.pack.as_ref().ok_or(Error::NotInitialized)?;
        self.song
            .play(song_index, self.sample_rate, pack, &mut self.mixer, &mut self.channels)
    }

    pub fn stop_song(&mut self) {
        self.song.stop(&mut self.mixer, &mut self.channels);
    }

    pub fn pause_song(&mut self) -> Result<()> {
        self.song.pause()
    }

    pub fn resume_song(&mut self) -> Result<()> {
        self.song.resume()
    }

    pub fn is_playing_song(&self) -> bool {
        self.song.is_playing()
    }

    pub fn song_state(&self) -> SongState {
        self.song.state()
    }

    pub fn set_song_master_volume(&mut self, volume: u8) {
        self.song.set_master_volume(volume, &mut self.mixer);
    }

    /// Plays `instrument_index` as a one-shot or looping sound effect.
    /// Returns a handle that may go stale if every SFX channel is busy and
    /// this one is later stolen (`spec.md` §4.5).
    pub fn play_sfx(&mut self, instrument_index: u32, loop_mode: LoopMode) -> Result<SfxHandle> {
        let pack = self.pack.as_ref().ok_or(Error::NotInitialized)?;
        self.sfx
            .play(instrument_index, loop_mode, self.sample_rate, pack, &mut self.mixer)
    }

    pub fn stop_sfx(&mut self, handle: SfxHandle) -> Result<()> {
        self.sfx.stop(handle, &mut self.mixer)
    }

    pub fn is_playing_sfx(&self, handle: SfxHandle) -> Result<bool> {
        self.sfx.is_playing(handle, &self.mixer)
    }

    pub fn release_sfx(&mut self, handle: SfxHandle) -> Result<()> {
        self.sfx.release(handle)
    }

    pub fn set_sfx_volume(&mut self, handle: SfxHandle, volume: u8) -> Result<()> {
        self.sfx.set_volume(handle, volume, &mut self.mixer)
    }

    pub fn set_sfx_panning(&mut self, handle: SfxHandle, pan: u8) -> Result<()> {
        self.sfx.set_panning(handle, pan, &mut self.mixer)
    }

    pub fn set_sfx_master_volume(&mut self, volume: u8) {
        self.sfx.set_master_volume(volume, &mut self.mixer);
    }

    /// `multiplier` is 16.16 fixed point applied to the default frequency of
    /// the instrument `handle` was last `play_sfx`ed with.
    pub fn set_sfx_frequency_multiplier(&mut self, handle: SfxHandle, multiplier: u32) -> Result<()> {
        let pack = self.pack.as_ref().ok_or(Error::NotInitialized)?;
        self.sfx
            .set_frequency_multiplier(handle, multiplier, self.sample_rate, pack, &mut self.mixer)
    }

    /// Fills `left`/`right` (same length) with mixed stereo frames, ticking
    /// the song scheduler as many times as needed along the way. Never
    /// fails: a channel that can't be driven just falls silent.
    ///
    /// Grounded on `UMOD_Mix`'s tick-interleaved loop, with the deviation
    /// that ticking only happens while the song is actually playing —
    /// paused or stopped songs still mix any SFX channels without advancing
    /// scheduling state.
    pub fn mix(&mut self, left: &mut [i8], right: &mut [i8]) {
        debug_assert_eq!(left.len(), right.len());

        let mut offset = 0;
        let total = left.len();

        while offset < total {
            if !self.song.is_playing() {
                self.mixer.mix(&mut left[offset..], &mut right[offset..], true);
                break;
            }

            if self.song.needs_tick() {
                if let Some(pack) = self.pack.as_ref() {
                    let _ = self
                        .song
                        .tick(self.sample_rate, pack, &mut self.mixer, &mut self.channels);
                }
                self.song.begin_tick_budget();
                if !self.song.is_playing() {
                    continue;
                }
            }

            let remaining = total - offset;
            let chunk = remaining.min(self.song.samples_left_for_tick() as usize);
            if chunk == 0 {
                break;
            }
            self.mixer
                .mix(&mut left[offset..offset + chunk], &mut right[offset..offset + chunk], false);
            self.song.consume(chunk as u32);
            offset += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::builder::{Instrument, PackBuilder};

    fn step_with(instrument: Option<u8>, note: Option<u8>, volume: Option<u8>, effect: Option<(u8, u8)>) -> Vec<u8> {
        let mut flags = 0u8;
        let mut out = Vec::new();
        if instrument.is_some() {
            flags |= 1;
        }
        if note.is_some() {
            flags |= 2;
        }
        if volume.is_some() {
            flags |= 4;
        }
        if effect.is_some() {
            flags |= 8;
        }
        out.push(flags);
        if let Some(v) = instrument {
            out.push(v);
        }
        if let Some(v) = note {
            out.push(v);
        }
        if let Some(v) = volume {
            out.push(v);
        }
        if let Some((code, params)) = effect {
            out.push(code);
            out.push(params);
        }
        out
    }

    fn no_field_step() -> Vec<u8> {
        vec![0]
    }

    /// Scenario A (`spec.md` §8): no pack loaded yet, `mix` produces silence
    /// and no panic.
    #[test]
    fn scenario_a_silence_before_any_pack_loaded() {
        let mut engine = Engine::new(32768);
        let mut left = [1i8; 64];
        let mut right = [1i8; 64];
        engine.mix(&mut left, &mut right);
        assert!(left.iter().all(|&s| s == 0));
        assert!(right.iter().all(|&s| s == 0));
    }

    /// Scenario B (`spec.md` §8): every SFX channel busy, releasing one lets
    /// a new `play_sfx` steal it and invalidates the old handle.
    #[test]
    fn scenario_b_sfx_channel_stealing_invalidates_old_handle() {
        let mut builder = PackBuilder::new();
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![10; 32],
        });
        let data = builder.build();

        let mut engine = Engine::new(32768);
        engine.load_pack(&data).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(engine.play_sfx(0, LoopMode::Default).unwrap());
        }
        assert_eq!(
            engine.play_sfx(0, LoopMode::Default),
            Err(Error::NoFreeChannel)
        );

        engine.release_sfx(handles[0]).unwrap();
        let stolen = engine.play_sfx(0, LoopMode::Default).unwrap();

        assert!(!engine.is_playing_sfx(handles[0]).unwrap());
        assert!(engine.is_playing_sfx(stolen).unwrap());
        assert_eq!(engine.set_sfx_volume(handles[0], 50), Err(Error::InvalidHandle));
    }

    /// Scenario C (`spec.md` §8): a song with a SET_SPEED effect changes its
    /// own tempo starting the next row.
    #[test]
    fn scenario_c_set_speed_effect_changes_tempo() {
        let mut builder = PackBuilder::new();
        let row0 = step_with(None, Some(0), None, Some((1, 3))); // SET_SPEED params=3
        let row1 = no_field_step();
        let mut steps = row0;
        steps.extend(row1);
        builder.add_pattern(1, 2, steps);
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![1; 32],
        });
        let data = builder.build();

        let mut engine = Engine::new(32768);
        engine.load_pack(&data).unwrap();
        engine.play_song(0).unwrap();
        assert_eq!(engine.song.song_speed(), 6);

        let mut left = [0i8; 4];
        let mut right = [0i8; 4];
        engine.mix(&mut left, &mut right);
        assert_eq!(engine.song.song_speed(), 3);
    }

    /// Scenario D (`spec.md` §8): `PortaToNote` converges on its target
    /// period and holds there rather than overshooting.
    #[test]
    fn scenario_d_portamento_converges() {
        let mut builder = PackBuilder::new();
        // Row 0: note C5 (note index 48), speed default.
        let row0 = step_with(Some(0), Some(48), Some(255), None);
        // Row 1: porta to C0 (note index 0) at speed 8 — the row's own note
        // field is the porta target, not a retrigger (`skip_note` in
        // `decode_row`).
        let row1 = step_with(None, Some(0), None, Some((15, 8)));
        let mut steps = row0;
        steps.extend(row1);
        for _ in 0..60 {
            steps.extend(no_field_step());
        }
        builder.add_pattern(1, 62, steps);
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![1; 32],
        });
        let data = builder.build();

        let mut engine = Engine::new(32768);
        engine.load_pack(&data).unwrap();
        engine.play_song(0).unwrap();

        // A tick only fires once `samples_left_for_tick` (one `samples_per_tick`
        // chunk, 655 frames at 32768 Hz / BPM 125) has actually been mixed, so
        // driving 372 ticks means mixing 372 chunks of that size, not 372
        // one-frame calls.
        const SAMPLES_PER_TICK: usize = 655;
        for _ in 0..(62 * 6) {
            let mut left = [0i8; SAMPLES_PER_TICK];
            let mut right = [0i8; SAMPLES_PER_TICK];
            engine.mix(&mut left, &mut right);
            if !engine.is_playing_song() {
                break;
            }
        }
        // The portamento should have long since converged and the song run
        // to completion without panicking.
        assert!(!engine.is_playing_song());
    }

    /// Scenario F (`spec.md` §8): sample-offset memory is reapplied when a
    /// later row repeats the effect with params 0.
    #[test]
    fn scenario_f_sample_offset_memory_reapplied_on_zero_params() {
        let mut builder = PackBuilder::new();
        let row0 = step_with(Some(0), Some(0), Some(255), Some((7, 0x10)));
        let row1 = step_with(None, Some(0), None, Some((7, 0)));
        let mut steps = row0;
        steps.extend(row1);
        builder.add_pattern(1, 2, steps);
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![1; 8192],
        });
        let data = builder.build();

        let mut engine = Engine::new(32768);
        engine.load_pack(&data).unwrap();
        engine.play_song(0).unwrap();

        // Default speed 6, BPM 125 at 32768 Hz gives 655 samples per tick.
        // Row 0 decodes on the very first tick; row 1 needs 6 more ticks
        // (the rest of row 0's speed-6 duration) to decode.
        let samples_per_tick = 655;
        let mut left = vec![0i8; samples_per_tick * 7];
        let mut right = vec![0i8; samples_per_tick * 7];
        engine.mix(&mut left, &mut right);
        assert_eq!(engine.channels[0].sample_offset_memory_for_test(), 0x1000);
    }
}
