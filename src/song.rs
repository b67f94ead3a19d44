//! The MOD song engine: row/tick scheduler over a bank of [`ModChannel`]s
//! (`spec.md` §4.4).
//!
//! Grounded on `examples/original_source/player/source/player.c`'s
//! `UMOD_Tick`/`UMOD_Mix`/`UMOD_PlaySong`: the tick-counting state machine,
//! the row decode order (instrument → note → volume → effect), and the
//! tick-interleaved mix loop all come from there. `PATTERN_BREAK` and
//! `JUMP_TO_PATTERN` are deferred to the end of the row here rather than
//! mutating pattern state mid-channel-loop the way the original does, which
//! matches `spec.md`'s "after this row" wording without the original's
//! read-from-the-wrong-pattern hazard for channels later in the same row.

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mixer::{Mixer, MOD_CHANNELS_MAX};
use crate::mod_channel::{Effect, ModChannel};
use crate::pack::Pack;
use crate::tables;

const FLAG_INSTRUMENT: u8 = 1;
const FLAG_NOTE: u8 = 2;
const FLAG_VOLUME: u8 = 4;
const FLAG_EFFECT: u8 = 8;

const DEFAULT_SONG_SPEED: u8 = 6;
const DEFAULT_BPM: u8 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SongState {
    Stopped,
    Paused,
    Playing,
}

struct DecodedStep {
    instrument: Option<u8>,
    note: Option<u8>,
    volume: Option<u8>,
    effect: Option<(u8, u8)>,
}

fn read_step(steps: &[u8], cursor: &mut usize) -> Result<DecodedStep> {
    let flags = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
    *cursor += 1;

    let instrument = if flags & FLAG_INSTRUMENT != 0 {
        let v = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
        *cursor += 1;
        Some(v)
    } else {
        None
    };
    let note = if flags & FLAG_NOTE != 0 {
        let v = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
        *cursor += 1;
        Some(v)
    } else {
        None
    };
    let volume = if flags & FLAG_VOLUME != 0 {
        let v = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
        *cursor += 1;
        Some(v)
    } else {
        None
    };
    let effect = if flags & FLAG_EFFECT != 0 {
        let code = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
        let params = *steps.get(*cursor + 1).ok_or(Error::IndexOutOfRange)?;
        *cursor += 2;
        Some((code, params))
    } else {
        None
    };

    Ok(DecodedStep {
        instrument,
        note,
        volume,
        effect,
    })
}

/// Advances `cursor` past `rows` rows of `channels` steps each, without
/// decoding field values — used to seek into a pattern after a break.
fn skip_rows(steps: &[u8], channels: u8, cursor: &mut usize, rows: u16) -> Result<()> {
    for _ in 0..rows {
        for _ in 0..channels {
            let flags = *steps.get(*cursor).ok_or(Error::IndexOutOfRange)?;
            *cursor += 1;
            if flags & FLAG_INSTRUMENT != 0 {
                *cursor += 1;
            }
            if flags & FLAG_NOTE != 0 {
                *cursor += 1;
            }
            if flags & FLAG_VOLUME != 0 {
                *cursor += 1;
            }
            if flags & FLAG_EFFECT != 0 {
                *cursor += 2;
            }
        }
    }
    Ok(())
}

/// Row/tick scheduler. Owns only scheduling state; the pack, mixer and
/// channel bank it drives are passed in by the caller (`Engine`) on every
/// call, the same separation `spec.md` §5 draws between engine state and
/// the pack it borrows.
pub struct Song {
    state: SongState,
    song_index: u32,
    length: u16,
    current_pattern: u16,
    current_row: u16,
    pattern_cursor: usize,
    pattern_channels: u8,
    pattern_rows: u8,
    song_speed: u8,
    current_ticks: u8,
    convert_constant: u64,
    samples_per_tick: u32,
    samples_left_for_tick: u32,
    master_volume: u8,
}

impl Song {
    pub fn new(sample_rate: u32) -> Self {
        Song {
            state: SongState::Stopped,
            song_index: 0,
            length: 0,
            current_pattern: 0,
            current_row: 0,
            pattern_cursor: 0,
            pattern_channels: 0,
            pattern_rows: 0,
            song_speed: DEFAULT_SONG_SPEED,
            current_ticks: 0,
            convert_constant: tables::convert_constant(sample_rate),
            samples_per_tick: Self::samples_per_tick_for_bpm(sample_rate, DEFAULT_BPM as u32),
            samples_left_for_tick: 0,
            master_volume: 255,
        }
    }

    pub fn state(&self) -> SongState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == SongState::Playing
    }

    fn samples_per_tick_for_bpm(sample_rate: u32, bpm: u32) -> u32 {
        let hz = (2 * bpm) / 5;
        sample_rate / hz.max(1)
    }

    fn set_speed(&mut self, sample_rate: u32, params: u8) {
        if params == 0 {
            return;
        }
        if params >= 0x20 {
            self.samples_per_tick = Self::samples_per_tick_for_bpm(sample_rate, params as u32);
        } else {
            self.song_speed = params;
        }
    }

    fn reload_pattern(&mut self, pack: &Pack) -> Result<()> {
        let song = pack.song(self.song_index)?;
        let pattern_index = song.pattern_index(self.current_pattern)?;
        let pattern = pack.pattern(pattern_index as u32)?;
        self.pattern_channels = pattern.channels.min(MOD_CHANNELS_MAX as u8);
        self.pattern_rows = pattern.rows;
        self.pattern_cursor = 0;
        Ok(())
    }

    /// Starts `song_index`, resetting all MOD channel state (`spec.md`
    /// §4.4: "play(i) resets, installs the song, sets default speed 6 / BPM
    /// 125, schedules an immediate first tick").
    pub fn play(
        &mut self,
        song_index: u32,
        sample_rate: u32,
        pack: &Pack,
        mixer: &mut Mixer,
        channels: &mut [ModChannel],
    ) -> Result<()> {
        if song_index >= pack.num_songs() {
            return Err(Error::IndexOutOfRange);
        }

        for ch in channels.iter_mut() {
            ch.reset(mixer);
        }

        self.song_index = song_index;
        self.length = pack.song(song_index)?.len();
        self.song_speed = DEFAULT_SONG_SPEED;
        self.samples_per_tick = Self::samples_per_tick_for_bpm(sample_rate, DEFAULT_BPM as u32);
        self.current_ticks = self.song_speed;
        self.samples_left_for_tick = 0;
        self.current_pattern = 0;
        self.current_row = 0;

        self.reload_pattern(pack)?;
        self.state = SongState::Playing;
        debug!(song_index, "song playing");
        Ok(())
    }

    pub fn stop(&mut self, mixer: &mut Mixer, channels: &mut [ModChannel]) {
        for ch in channels.iter_mut() {
            ch.reset(mixer);
        }
        self.state = SongState::Stopped;
        debug!("song stopped");
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.state != SongState::Playing {
            return Err(Error::InvalidState);
        }
        self.state = SongState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != SongState::Paused {
            return Err(Error::InvalidState);
        }
        self.state = SongState::Playing;
        Ok(())
    }

    pub fn set_master_volume(&mut self, volume: u8, mixer: &mut Mixer) {
        self.master_volume = volume;
        for i in 0..MOD_CHANNELS_MAX {
            mixer.channel_mut(i).set_master_volume(volume);
        }
    }

    fn decode_row(
        &mut self,
        sample_rate: u32,
        pack: &Pack,
        mixer: &mut Mixer,
        channels: &mut [ModChannel],
    ) -> Result<(Option<u8>, Option<u8>)> {
        let pattern = {
            let song = pack.song(self.song_index)?;
            let idx = song.pattern_index(self.current_pattern)?;
            pack.pattern(idx as u32)?
        };

        let mut pattern_break = None;
        let mut jump_to_pattern = None;

        for c in 0..self.pattern_channels as usize {
            let step = read_step(pattern.steps, &mut self.pattern_cursor)?;
            let ch = &mut channels[c];

            let effect_code = step.effect.map(|(c, _)| c);
            let is_delay_note = effect_code == Some(6); // DELAY_NOTE

            if is_delay_note {
                let (_, params) = step.effect.unwrap();
                ch.set_effect_delay_note(params, step.note, step.volume, step.instrument.map(|i| i as u16));
                continue;
            }

            if let Some(instrument) = step.instrument {
                if let Err(e) = ch.set_instrument(instrument as u16, mixer, pack) {
                    warn!(channel = c, ?e, "bad instrument reference, channel left silent");
                }
                if step.volume.is_none() {
                    if let Ok(inst) = pack.instrument(instrument as u32) {
                        ch.set_volume(inst.volume, mixer);
                    }
                }
            }

            let skip_note = matches!(effect_code, Some(15) | Some(16)); // PORTA_TO_NOTE, PORTA_VOL_SLIDE
            if let Some(note) = step.note {
                if !skip_note {
                    if let Err(e) = ch.set_note(note, mixer, pack, self.convert_constant) {
                        warn!(channel = c, ?e, "note could not be programmed, channel stopped");
                    }
                }
            }

            if let Some(volume) = step.volume {
                ch.set_volume(volume, mixer);
            }

            let effect_result = match step.effect {
                Some((1, params)) => {
                    self.set_speed(sample_rate, params);
                    Ok(())
                }
                Some((2, params)) => {
                    pattern_break = Some(params);
                    Ok(())
                }
                Some((3, params)) => {
                    jump_to_pattern = Some(params);
                    Ok(())
                }
                Some((code, params)) => {
                    ch.set_effect(Effect::from_code(code), params, step.note, mixer, pack, self.convert_constant)
                }
                None => ch.set_effect(Effect::None, 0, step.note, mixer, pack, self.convert_constant),
            };
            if let Err(e) = effect_result {
                warn!(channel = c, ?e, "effect could not be applied, channel stopped");
            }
        }

        Ok((pattern_break, jump_to_pattern))
    }

    /// Advances scheduling state by one tick (~1/50s of musical time at
    /// default speed). Called by `Engine::mix` whenever
    /// `samples_left_for_tick` reaches zero.
    pub fn tick(
        &mut self,
        sample_rate: u32,
        pack: &Pack,
        mixer: &mut Mixer,
        channels: &mut [ModChannel],
    ) -> Result<()> {
        if self.state != SongState::Playing {
            return Ok(());
        }

        self.current_ticks += 1;

        if self.current_ticks < self.song_speed {
            for (c, ch) in channels[..self.pattern_channels as usize].iter_mut().enumerate() {
                if let Err(e) = ch.update_tick_n(self.current_ticks, mixer, pack, self.convert_constant) {
                    warn!(channel = c, ?e, "tick effect could not be applied");
                }
            }
            return Ok(());
        }

        self.current_ticks = 0;

        if self.current_row >= self.pattern_rows as u16 {
            self.current_pattern += 1;
            self.current_row = 0;

            if self.current_pattern >= self.length {
                trace!("end of song reached");
                self.stop(mixer, channels);
                return Ok(());
            }
            self.reload_pattern(pack)?;
        }

        let (pattern_break, jump_to_pattern) = self.decode_row(sample_rate, pack, mixer, channels)?;

        for (c, ch) in channels[..self.pattern_channels as usize].iter_mut().enumerate() {
            if let Err(e) = ch.update_tick_0(mixer, pack, self.convert_constant) {
                warn!(channel = c, ?e, "row-start effect could not be applied");
            }
        }

        if let Some(target) = jump_to_pattern {
            self.current_pattern = (target as u16).min(self.length.saturating_sub(1));
            self.current_row = 0;
            self.reload_pattern(pack)?;
        } else if let Some(row) = pattern_break {
            self.current_pattern += 1;
            if self.current_pattern >= self.length {
                self.stop(mixer, channels);
                return Ok(());
            }
            self.reload_pattern(pack)?;
            let target_row = (row as u16).min(self.pattern_rows as u16);
            let pattern = {
                let song = pack.song(self.song_index)?;
                let idx = song.pattern_index(self.current_pattern)?;
                pack.pattern(idx as u32)?
            };
            skip_rows(pattern.steps, self.pattern_channels, &mut self.pattern_cursor, target_row)?;
            self.current_row = target_row;
        } else {
            self.current_row += 1;
        }

        Ok(())
    }

    pub fn samples_left_for_tick(&self) -> u32 {
        self.samples_left_for_tick
    }

    pub fn begin_tick_budget(&mut self) {
        self.samples_left_for_tick = self.samples_per_tick;
    }

    pub fn consume(&mut self, frames: u32) {
        self.samples_left_for_tick = self.samples_left_for_tick.saturating_sub(frames);
    }

    pub fn needs_tick(&self) -> bool {
        self.samples_left_for_tick == 0
    }

    #[cfg(test)]
    pub(crate) fn song_speed(&self) -> u8 {
        self.song_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::builder::{Instrument, PackBuilder};

    fn channel_bank() -> Vec<ModChannel> {
        (0..MOD_CHANNELS_MAX).map(ModChannel::new).collect()
    }

    #[test]
    fn set_speed_updates_song_speed() {
        let mut builder = PackBuilder::new();
        // One channel, one row, effect SET_SPEED(code 1) params=3.
        let steps = vec![0b1000u8, 1, 3];
        builder.add_pattern(1, 1, steps);
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![0; 16],
        });
        let data = builder.build();
        let pack = Pack::load(&data).unwrap();

        let mut mixer = Mixer::new();
        let mut channels = channel_bank();
        let mut song = Song::new(32768);
        song.play(0, 32768, &pack, &mut mixer, &mut channels).unwrap();
        song.tick(32768, &pack, &mut mixer, &mut channels).unwrap();

        assert_eq!(song.song_speed, 3);
    }

    #[test]
    fn playing_past_song_end_stops() {
        let mut builder = PackBuilder::new();
        let steps = vec![0u8]; // no fields, single channel
        builder.add_pattern(1, 1, steps);
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![0; 16],
        });
        let data = builder.build();
        let pack = Pack::load(&data).unwrap();

        let mut mixer = Mixer::new();
        let mut channels = channel_bank();
        let mut song = Song::new(32768);
        song.play(0, 32768, &pack, &mut mixer, &mut channels).unwrap();
        assert!(song.is_playing());

        // Tick 1 decodes row 0 (current_row -> 1). Row advances again only
        // once current_ticks next reaches song_speed (6), i.e. tick 7, which
        // rolls into pattern index 1 — past length 1.
        for _ in 0..7 {
            song.tick(32768, &pack, &mut mixer, &mut channels).unwrap();
        }
        assert!(!song.is_playing());
    }
}
