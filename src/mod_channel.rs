//! Per-channel tracker effect state and the note/finetune→period pipeline
//! (`spec.md` §4.3).
//!
//! Grounded on `examples/original_source/player/source/mod_channel.c`, which
//! gives the channel-info shape (`note`, `volume`, `instrument_pointer`,
//! `panning`, `effect`, `effect_params`, `arpeggio_tick`,
//! `mixer_channel_handle`) and stubs arpeggio and cut-note — the rest of the
//! effect table (vibrato, tremolo, every portamento variant, retrigger,
//! delay, sample-offset memory) is this crate's addition per `spec.md`
//! §4.3, since the original left them as `// TODO`.

use tracing::{trace, warn};

use crate::error::Result;
use crate::mixer::Mixer;
use crate::pack::Pack;
use crate::tables;

/// Tracker effect codes, in the exact order `spec.md` §6 enumerates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    SetSpeed,
    PatternBreak,
    JumpToPattern,
    CutNote,
    RetrigNote,
    DelayNote,
    SampleOffset,
    SetPanning,
    VolumeSlide,
    FineVolumeSlide,
    PortaUp,
    PortaDown,
    FinePortaUp,
    FinePortaDown,
    PortaToNote,
    PortaVolSlide,
    Vibrato,
    VibratoVolSlide,
    VibratoWaveform,
    Arpeggio,
    Tremolo,
    TremoloWaveform,
}

impl Effect {
    /// Decodes a pattern step's effect byte. An out-of-range code cannot be
    /// rejected through the closed error set (`spec.md` §7 does not carry an
    /// error kind for it), so this logs and falls back to `None` — the
    /// authoring-tool bug `spec.md` §9 calls out, surfaced as a log line
    /// rather than silently played as whatever garbage code showed up.
    pub fn from_code(code: u8) -> Effect {
        match code {
            0 => Effect::None,
            1 => Effect::SetSpeed,
            2 => Effect::PatternBreak,
            3 => Effect::JumpToPattern,
            4 => Effect::CutNote,
            5 => Effect::RetrigNote,
            6 => Effect::DelayNote,
            7 => Effect::SampleOffset,
            8 => Effect::SetPanning,
            9 => Effect::VolumeSlide,
            10 => Effect::FineVolumeSlide,
            11 => Effect::PortaUp,
            12 => Effect::PortaDown,
            13 => Effect::FinePortaUp,
            14 => Effect::FinePortaDown,
            15 => Effect::PortaToNote,
            16 => Effect::PortaVolSlide,
            17 => Effect::Vibrato,
            18 => Effect::VibratoVolSlide,
            19 => Effect::VibratoWaveform,
            20 => Effect::Arpeggio,
            21 => Effect::Tremolo,
            22 => Effect::TremoloWaveform,
            other => {
                warn!(code = other, "unknown effect code, treating as no-op");
                Effect::None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DelayedNote {
    ticks: u8,
    note: Option<u8>,
    volume: Option<u8>,
    instrument: Option<u16>,
}

/// One tracker channel's full effect memory, plus the mixer row it drives.
pub struct ModChannel {
    mixer_channel: usize,
    current_note: Option<u8>,
    /// Octave-adjusted Amiga period for the channel's base note, before any
    /// per-tick vibrato/arpeggio offset.
    amiga_period: u32,
    volume: u8,
    instrument_ref: Option<u16>,
    panning: u8,
    effect: Effect,
    effect_params: u8,
    arpeggio_tick: u8,
    vibrato_tick: u8,
    vibrato_speed: u8,
    vibrato_depth: u8,
    vibrato_wave_table_ref: u8,
    vibrato_retrigger_flag: bool,
    tremolo_tick: u8,
    tremolo_speed: u8,
    tremolo_depth: u8,
    tremolo_wave_table_ref: u8,
    tremolo_retrigger_flag: bool,
    retrig_tick: u8,
    porta_target_amiga_period: u32,
    porta_speed: u8,
    delayed: Option<DelayedNote>,
    sample_offset_memory: u32,
}

impl ModChannel {
    pub fn new(mixer_channel: usize) -> Self {
        ModChannel {
            mixer_channel,
            current_note: None,
            amiga_period: 0,
            volume: 0,
            instrument_ref: None,
            panning: 128,
            effect: Effect::None,
            effect_params: 0,
            arpeggio_tick: 0,
            vibrato_tick: 0,
            vibrato_speed: 0,
            vibrato_depth: 0,
            vibrato_wave_table_ref: 0,
            vibrato_retrigger_flag: true,
            tremolo_tick: 0,
            tremolo_speed: 0,
            tremolo_depth: 0,
            tremolo_wave_table_ref: 0,
            tremolo_retrigger_flag: true,
            retrig_tick: 0,
            porta_target_amiga_period: 0,
            porta_speed: 0,
            delayed: None,
            sample_offset_memory: 0,
        }
    }

    /// Stops the mixer channel this row drives and zeroes effect memory.
    pub fn reset(&mut self, mixer: &mut Mixer) {
        mixer.channel_mut(self.mixer_channel).stop();
        self.current_note = None;
        self.amiga_period = 0;
        self.volume = 0;
        self.instrument_ref = None;
        self.effect = Effect::None;
        self.effect_params = 0;
        self.panning = 128;
        self.delayed = None;
        self.sample_offset_memory = 0;
    }

    fn finetune(&self, pack: &Pack) -> u8 {
        self.instrument_ref
            .and_then(|idx| pack.instrument(idx as u32).ok())
            .map(|inst| inst.finetune)
            .unwrap_or(0)
    }

    fn apply_period(&self, period: u64, mixer: &mut Mixer, reset_position: bool) -> Result<()> {
        let ch = mixer.channel_mut(self.mixer_channel);
        if reset_position {
            ch.set_note_period(period)
        } else {
            ch.set_note_period_porta(period)
        }
    }

    /// Recomputes and programs the mixer period for `note`, using the
    /// current instrument's finetune.
    fn period_for_note(&self, note: u8, pack: &Pack, convert_constant: u64) -> (u32, u64) {
        let finetune = self.finetune(pack);
        let amiga = tables::amiga_period(note as usize, finetune as usize);
        let period = tables::sample_tick_period(note as usize, finetune as usize, convert_constant);
        (amiga, period)
    }

    pub fn set_note(
        &mut self,
        note: u8,
        mixer: &mut Mixer,
        pack: &Pack,
        convert_constant: u64,
    ) -> Result<()> {
        self.current_note = Some(note);
        let (amiga, period) = self.period_for_note(note, pack, convert_constant);
        self.amiga_period = amiga;
        self.vibrato_tick = 0;
        trace!(channel = self.mixer_channel, note, "note set");
        self.apply_period(period, mixer, true)
    }

    pub fn set_volume(&mut self, volume: u8, mixer: &mut Mixer) {
        self.volume = volume;
        mixer.channel_mut(self.mixer_channel).set_volume(volume);
    }

    pub fn set_instrument(&mut self, instrument_ref: u16, mixer: &mut Mixer, pack: &Pack) -> Result<()> {
        self.instrument_ref = Some(instrument_ref);
        let inst = pack.instrument(instrument_ref as u32)?;
        mixer.channel_mut(self.mixer_channel).set_instrument(&inst);
        Ok(())
    }

    pub fn set_effect_delay_note(
        &mut self,
        ticks: u8,
        note: Option<u8>,
        volume: Option<u8>,
        instrument: Option<u16>,
    ) {
        self.delayed = Some(DelayedNote {
            ticks,
            note,
            volume,
            instrument,
        });
    }

    /// Primes effect memory for a freshly decoded row. `note_on_row` is the
    /// row's own note field (if any) — distinct from `current_note`, which
    /// may already have been applied by `set_note` before this call.
    pub fn set_effect(
        &mut self,
        effect: Effect,
        params: u8,
        note_on_row: Option<u8>,
        mixer: &mut Mixer,
        pack: &Pack,
        convert_constant: u64,
    ) -> Result<()> {
        let previous_effect = self.effect;
        self.effect = effect;
        self.effect_params = params;

        if previous_effect == Effect::Arpeggio && effect != Effect::Arpeggio && note_on_row.is_none()
        {
            if let Some(note) = self.current_note {
                let (_, period) = self.period_for_note(note, pack, convert_constant);
                self.apply_period(period, mixer, false)?;
            }
        }

        match effect {
            Effect::None
            | Effect::SetSpeed
            | Effect::PatternBreak
            | Effect::JumpToPattern
            | Effect::DelayNote
            | Effect::CutNote
            | Effect::VolumeSlide
            | Effect::FineVolumeSlide
            | Effect::SampleOffset
            | Effect::PortaUp
            | Effect::PortaDown
            | Effect::FinePortaUp
            | Effect::FinePortaDown => {}
            Effect::SetPanning => {
                self.panning = params;
                mixer.channel_mut(self.mixer_channel).set_panning(params);
            }
            Effect::Arpeggio => {
                self.arpeggio_tick = 0;
            }
            Effect::RetrigNote => {
                self.retrig_tick = 0;
            }
            Effect::Vibrato | Effect::VibratoVolSlide => {
                let speed = params >> 4;
                let depth = params & 0xF;
                if speed != 0 {
                    self.vibrato_speed = speed;
                }
                if depth != 0 {
                    self.vibrato_depth = depth;
                }
                if note_on_row.is_some() && self.vibrato_retrigger_flag {
                    self.vibrato_tick = 0;
                }
            }
            Effect::VibratoWaveform => {
                self.vibrato_wave_table_ref = params & 0x3;
                self.vibrato_retrigger_flag = params & 0x4 == 0;
            }
            Effect::Tremolo => {
                let speed = params >> 4;
                let depth = params & 0xF;
                if speed != 0 {
                    self.tremolo_speed = speed;
                }
                if depth != 0 {
                    self.tremolo_depth = depth;
                }
                if note_on_row.is_some() && self.tremolo_retrigger_flag {
                    self.tremolo_tick = 0;
                }
            }
            Effect::TremoloWaveform => {
                self.tremolo_wave_table_ref = params & 0x3;
                self.tremolo_retrigger_flag = params & 0x4 == 0;
            }
            Effect::PortaToNote | Effect::PortaVolSlide => {
                if effect == Effect::PortaToNote && params != 0 {
                    self.porta_speed = params;
                }
                if let Some(note) = note_on_row {
                    let finetune = self.finetune(pack);
                    self.porta_target_amiga_period =
                        tables::amiga_period(note as usize, finetune as usize);
                }
            }
        }

        Ok(())
    }

    fn apply_delayed_note(&mut self, mixer: &mut Mixer, pack: &Pack, convert_constant: u64) -> Result<()> {
        let delayed = match self.delayed.take() {
            Some(d) => d,
            None => return Ok(()),
        };
        if let Some(instrument) = delayed.instrument {
            self.set_instrument(instrument, mixer, pack)?;
        }
        if let Some(note) = delayed.note {
            self.set_note(note, mixer, pack, convert_constant)?;
        }
        if let Some(volume) = delayed.volume {
            self.set_volume(volume, mixer);
        }
        Ok(())
    }

    fn apply_volume_slide(&mut self, params: u8, mixer: &mut Mixer) {
        let delta = params as i8 as i32;
        let new_volume = (self.volume as i32 + delta).clamp(0, 255) as u8;
        self.set_volume(new_volume, mixer);
    }

    /// Runs effects that fire once at the start of a row (tick 0, after row
    /// decoding and tick-0-phase application of instrument/note/volume).
    pub fn update_tick_0(&mut self, mixer: &mut Mixer, pack: &Pack, convert_constant: u64) -> Result<()> {
        match self.effect {
            Effect::Arpeggio => {
                self.arpeggio_tick = 0;
                if let Some(note) = self.current_note {
                    let (_, period) = self.period_for_note(note, pack, convert_constant);
                    self.apply_period(period, mixer, false)?;
                }
            }
            Effect::FinePortaUp => {
                self.amiga_period = self.amiga_period.saturating_sub(self.effect_params as u32);
                let period = tables::sample_tick_period_from_raw(self.amiga_period, convert_constant);
                self.apply_period(period, mixer, false)?;
            }
            Effect::FinePortaDown => {
                self.amiga_period = self.amiga_period.saturating_add(self.effect_params as u32);
                let period = tables::sample_tick_period_from_raw(self.amiga_period, convert_constant);
                self.apply_period(period, mixer, false)?;
            }
            Effect::FineVolumeSlide => {
                self.apply_volume_slide(self.effect_params, mixer);
            }
            Effect::SampleOffset => {
                if self.effect_params != 0 {
                    self.sample_offset_memory = (self.effect_params as u32) << 8;
                }
                let offset = self.sample_offset_memory;
                let _ = mixer.channel_mut(self.mixer_channel).set_sample_offset(offset);
            }
            Effect::CutNote if self.effect_params == 0 => {
                self.set_volume(0, mixer);
                self.effect = Effect::None;
            }
            Effect::RetrigNote => {
                self.retrig_tick = 0;
            }
            _ => {}
        }

        if matches!(self.delayed, Some(d) if d.ticks == 0) {
            self.apply_delayed_note(mixer, pack, convert_constant)?;
        }

        Ok(())
    }

    /// Runs effects that fire on intra-row ticks `n >= 1`.
    pub fn update_tick_n(
        &mut self,
        tick: u8,
        mixer: &mut Mixer,
        pack: &Pack,
        convert_constant: u64,
    ) -> Result<()> {
        match self.effect {
            Effect::PortaUp => {
                self.amiga_period = self.amiga_period.saturating_sub(self.effect_params as u32);
                let period = tables::sample_tick_period_from_raw(self.amiga_period, convert_constant);
                self.apply_period(period, mixer, false)?;
            }
            Effect::PortaDown => {
                self.amiga_period = self.amiga_period.saturating_add(self.effect_params as u32);
                let period = tables::sample_tick_period_from_raw(self.amiga_period, convert_constant);
                self.apply_period(period, mixer, false)?;
            }
            Effect::Vibrato => {
                self.step_vibrato(mixer, convert_constant)?;
            }
            Effect::VibratoVolSlide => {
                self.step_vibrato(mixer, convert_constant)?;
                self.apply_volume_slide(self.effect_params, mixer);
            }
            Effect::Tremolo => {
                self.step_tremolo(mixer);
            }
            Effect::VolumeSlide => {
                self.apply_volume_slide(self.effect_params, mixer);
            }
            Effect::PortaToNote => {
                self.step_porta_to_note(mixer, convert_constant)?;
            }
            Effect::PortaVolSlide => {
                self.step_porta_to_note(mixer, convert_constant)?;
                self.apply_volume_slide(self.effect_params, mixer);
            }
            Effect::CutNote if self.effect_params == tick => {
                self.set_volume(0, mixer);
                self.effect = Effect::None;
            }
            Effect::RetrigNote if self.effect_params != 0 => {
                self.retrig_tick += 1;
                if self.retrig_tick >= self.effect_params {
                    self.retrig_tick = 0;
                    let _ = mixer.channel_mut(self.mixer_channel).set_sample_offset(0);
                }
            }
            _ => {}
        }

        if matches!(self.delayed, Some(d) if d.ticks == tick) {
            self.apply_delayed_note(mixer, pack, convert_constant)?;
        }

        Ok(())
    }

    fn step_vibrato(&mut self, mixer: &mut Mixer, convert_constant: u64) -> Result<()> {
        let table = tables::wave_table(self.vibrato_wave_table_ref);
        let offset = (table[self.vibrato_tick as usize] as i32 * self.vibrato_depth as i32) >> 7;
        let bent = (self.amiga_period as i32 + offset).max(0) as u32;
        let period = tables::sample_tick_period_from_raw(bent, convert_constant);
        self.vibrato_tick = (self.vibrato_tick + self.vibrato_speed) & 63;
        self.apply_period(period, mixer, false)
    }

    fn step_tremolo(&mut self, mixer: &mut Mixer) {
        let table = tables::wave_table(self.tremolo_wave_table_ref);
        let offset = (table[self.tremolo_tick as usize] as i32 * self.tremolo_depth as i32) >> 4;
        let volume = (self.volume as i32 + offset).clamp(0, 255) as u8;
        self.tremolo_tick = (self.tremolo_tick + self.tremolo_speed) & 63;
        mixer.channel_mut(self.mixer_channel).set_volume(volume);
    }

    fn step_porta_to_note(&mut self, mixer: &mut Mixer, convert_constant: u64) -> Result<()> {
        let target = self.porta_target_amiga_period;
        let speed = self.porta_speed as u32;
        if self.amiga_period > target {
            self.amiga_period = self.amiga_period.saturating_sub(speed).max(target);
        } else if self.amiga_period < target {
            self.amiga_period = (self.amiga_period + speed).min(target);
        }
        let period = tables::sample_tick_period_from_raw(self.amiga_period, convert_constant);
        self.apply_period(period, mixer, false)
    }

    pub fn is_playing(&self, mixer: &Mixer) -> bool {
        mixer.channel(self.mixer_channel).is_playing()
    }

    #[cfg(test)]
    pub(crate) fn sample_offset_memory_for_test(&self) -> u32 {
        self.sample_offset_memory
    }
}
