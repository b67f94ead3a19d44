//! Fixed-point multi-channel sample mixer (`spec.md` §4.2).
//!
//! Ported from the single-sample interpolation loop in
//! `examples/Gnurou-awer/src/audio.rs`'s `ClassicMixer::fill_buffer`, widened
//! from a 4-channel mono mixer with an 8.8 `chunk_pos` to the
//! [`MIXER_CHANNELS_MAX`]-channel stereo, 20.12 fixed-point, block-unrolled
//! mixer this spec calls for. The per-sample accumulate/clamp shape —
//! walk active channels, read `pointer[position]`, scale by volume, clamp
//! into `i8` — is the same idea; the position arithmetic and loop/stop state
//! machine are new to match §4.2 exactly.

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pack::InstrumentView;

/// Song channels (`spec.md` §3 resolution, see SPEC_FULL.md §3).
pub const MOD_CHANNELS_MAX: usize = 16;
/// Channels reserved for the SFX manager.
pub const SFX_CHANNELS: usize = 4;
/// Total mixer channel rows: song channels first, then SFX channels.
pub const MIXER_CHANNELS_MAX: usize = MOD_CHANNELS_MAX + SFX_CHANNELS;

/// Frames processed per inner unrolled block before per-channel loop/stop
/// bookkeeping runs.
pub const UNROLL: usize = 16;

/// Bits of fractional precision in sample positions (20.12 fixed point).
const POS_FRAC_BITS: u32 = 12;

/// Upper bound on `position_inc_per_sample`: 16 consecutive reads past
/// `size` must stay within the instrument's `EXTRA_SAMPLES` pad.
const MAX_POSITION_INC: u32 = ((crate::pack::EXTRA_SAMPLES / UNROLL) as u32) << POS_FRAC_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stop,
    Play,
    Loop,
}

/// How [`MixerChannel::set_loop`] should treat the instrument's own loop
/// points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Respect the instrument's own loop fields.
    Default,
    /// Impose whole-waveform looping if the instrument has none.
    Enable,
    /// Clear looping unconditionally.
    Disable,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample<'a> {
    /// Borrowed PCM data for the instrument currently programmed on this
    /// channel, `EXTRA_SAMPLES` read-ahead pad included. `None` while no
    /// instrument has been programmed.
    data: Option<&'a [i8]>,
    size: u32,       // 20.12
    loop_start: u32, // 20.12
    loop_end: u32,   // 20.12
    position: u32,   // 20.12
    position_inc_per_sample: u32, // 20.12
}

/// One row of the mixer's channel array.
#[derive(Debug, Clone, Copy)]
pub struct MixerChannel<'a> {
    play_state: PlayState,
    master_volume: u8,
    volume: u8,
    left_pan: u8,
    right_pan: u8,
    left_vol: u32,
    right_vol: u32,
    sample: Sample<'a>,
    /// Whether the instrument currently programmed has its own loop points.
    instrument_has_loop: bool,
}

impl<'a> Default for MixerChannel<'a> {
    fn default() -> Self {
        MixerChannel {
            play_state: PlayState::Stop,
            master_volume: 255,
            volume: 255,
            left_pan: 128,
            right_pan: 128,
            left_vol: 0,
            right_vol: 0,
            sample: Sample::default(),
            instrument_has_loop: false,
        }
    }
}

impl<'a> MixerChannel<'a> {
    fn refresh_cached_volumes(&mut self) {
        self.left_vol =
            (self.master_volume as u32 * self.volume as u32 * self.left_pan as u32) >> 8;
        self.right_vol =
            (self.master_volume as u32 * self.volume as u32 * self.right_pan as u32) >> 8;
    }

    pub fn is_playing(&self) -> bool {
        self.play_state != PlayState::Stop
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn start(&mut self) {
        if self.sample.data.is_some() {
            self.play_state = PlayState::Play;
        }
    }

    pub fn stop(&mut self) {
        self.play_state = PlayState::Stop;
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume;
        self.refresh_cached_volumes();
    }

    pub fn set_master_volume(&mut self, volume: u8) {
        self.master_volume = volume;
        self.refresh_cached_volumes();
    }

    pub fn set_panning(&mut self, pan: u8) {
        self.left_pan = 255 - pan;
        self.right_pan = pan;
        self.refresh_cached_volumes();
    }

    /// Programs this channel with an instrument's waveform. Resets loop
    /// bounds to whatever the instrument declares; does not touch playback
    /// position (`set_note_period` does that).
    pub fn set_instrument(&mut self, instrument: &InstrumentView<'a>) {
        self.sample.data = Some(instrument.data);
        self.sample.size = instrument.size << POS_FRAC_BITS;
        self.sample.loop_start = instrument.loop_start << POS_FRAC_BITS;
        self.sample.loop_end = instrument.loop_end << POS_FRAC_BITS;
        self.instrument_has_loop = instrument.loop_end > instrument.loop_start;
    }

    fn increment_for_period(period: u64) -> Result<u32> {
        if period == 0 {
            return Err(Error::BadOffset);
        }
        // position_inc_per_sample (20.12) = 1.0 (in 20.12) / period (32.32),
        // i.e. (1 << 44) / period yields a 20.12 value directly since
        // 44 = 12 + 32.
        let inc = ((1u64 << 44) / period) as u32;
        if inc >= MAX_POSITION_INC {
            return Err(Error::BadOffset);
        }
        Ok(inc)
    }

    /// Sets the playback period (32.32 fixed point) and resets the read
    /// position to the start of the waveform. Period 0 stops the channel.
    pub fn set_note_period(&mut self, period: u64) -> Result<()> {
        let inc = match Self::increment_for_period(period) {
            Ok(inc) => inc,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        self.sample.position = 0;
        self.sample.position_inc_per_sample = inc;
        self.play_state = PlayState::Play;
        Ok(())
    }

    /// Like [`Self::set_note_period`] but does not reset the read position;
    /// used by portamento and vibrato, which bend pitch without retriggering
    /// the waveform.
    pub fn set_note_period_porta(&mut self, period: u64) -> Result<()> {
        let inc = match Self::increment_for_period(period) {
            Ok(inc) => inc,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        self.sample.position_inc_per_sample = inc;
        Ok(())
    }

    /// Sets the read position to `offset` whole samples. Fails (and stops
    /// the channel) if `offset` is past the instrument's declared size.
    pub fn set_sample_offset(&mut self, offset: u32) -> Result<()> {
        let pos = (offset as u64) << POS_FRAC_BITS;
        if pos >= self.sample.size as u64 {
            self.stop();
            return Err(Error::BadOffset);
        }
        self.sample.position = pos as u32;
        Ok(())
    }

    pub fn set_loop(&mut self, mode: LoopMode, instrument: &InstrumentView<'a>) {
        match mode {
            LoopMode::Default => {
                self.sample.loop_start = instrument.loop_start << POS_FRAC_BITS;
                self.sample.loop_end = instrument.loop_end << POS_FRAC_BITS;
            }
            LoopMode::Enable => {
                if !self.instrument_has_loop {
                    self.sample.loop_start = 0;
                    self.sample.loop_end = instrument.size << POS_FRAC_BITS;
                }
            }
            LoopMode::Disable => {
                self.sample.loop_start = 0;
                self.sample.loop_end = 0;
            }
        }
    }
}

/// The mixer: owns every channel row and turns programmed state into stereo
/// output. Borrows instrument PCM data for as long as any channel has it
/// programmed, so its lifetime is tied to the pack that was loaded.
pub struct Mixer<'a> {
    channels: [MixerChannel<'a>; MIXER_CHANNELS_MAX],
}

impl<'a> Mixer<'a> {
    pub fn new() -> Self {
        Mixer {
            channels: [MixerChannel::default(); MIXER_CHANNELS_MAX],
        }
    }

    pub fn channel(&self, index: usize) -> &MixerChannel<'a> {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut MixerChannel<'a> {
        &mut self.channels[index]
    }

    /// Mixes `left.len()` frames (left and right buffers must be the same
    /// length) from every active channel in `0..MIXER_CHANNELS_MAX`, or, if
    /// `skip_song_channels` is set, only from the SFX channels
    /// (`MOD_CHANNELS_MAX..MIXER_CHANNELS_MAX`) — used while the song is
    /// paused or stopped.
    pub fn mix(&mut self, left: &mut [i8], right: &mut [i8], skip_song_channels: bool) {
        debug_assert_eq!(left.len(), right.len());

        let start_channel = if skip_song_channels {
            MOD_CHANNELS_MAX
        } else {
            0
        };

        let mut active: Vec<usize> = (start_channel..MIXER_CHANNELS_MAX)
            .filter(|&i| {
                let ch = &self.channels[i];
                ch.play_state != PlayState::Stop && ch.sample.data.is_some()
            })
            .collect();

        let total_frames = left.len();
        let mut frame = 0;
        while frame < total_frames {
            let block_len = UNROLL.min(total_frames - frame);
            self.mix_block(&active, &mut left[frame..frame + block_len], &mut right[frame..frame + block_len]);
            self.advance_play_state(&mut active);
            frame += block_len;
        }
    }

    fn mix_block(&mut self, active: &[usize], left: &mut [i8], right: &mut [i8]) {
        for n in 0..left.len() {
            let mut total_left: i32 = 0;
            let mut total_right: i32 = 0;

            for &idx in active {
                let ch = &mut self.channels[idx];
                let sample_index = (ch.sample.position >> POS_FRAC_BITS) as usize;
                // `position < size` is an engine invariant (spec.md §8
                // invariant 1), and instruments are padded with
                // EXTRA_SAMPLES so unrolled read-ahead up to UNROLL frames
                // past `size` stays in bounds (invariant 2), so this index
                // is always in range.
                let value = ch.sample.data.unwrap()[sample_index];

                total_left += value as i32 * ch.left_vol as i32;
                total_right += value as i32 * ch.right_vol as i32;

                ch.sample.position = ch.sample.position.wrapping_add(ch.sample.position_inc_per_sample);
            }

            // Total = sample(-128..127) * left_vol/right_vol
            // (master*volume*pan >> 8, each 0..255, so left_vol/right_vol is
            // 0..65025). Divide by 4 * 256 * 256 (shift 18) to scale back
            // down; the /4 leaves headroom above the naive mean so mixes of
            // a handful of channels stay audible without clipping.
            let out_left = (total_left >> 18).clamp(-128, 127) as i8;
            let out_right = (total_right >> 18).clamp(-128, 127) as i8;
            left[n] = out_left;
            right[n] = out_right;
        }
    }

    fn advance_play_state(&mut self, active: &mut Vec<usize>) {
        active.retain(|&idx| {
            let ch = &mut self.channels[idx];
            match ch.play_state {
                PlayState::Play => {
                    if ch.sample.position >= ch.sample.size {
                        if ch.sample.loop_end == ch.sample.loop_start {
                            ch.play_state = PlayState::Stop;
                            trace!(channel = idx, "channel stopped at end of sample");
                            return false;
                        } else {
                            ch.sample.position -= ch.sample.size - ch.sample.loop_start;
                            ch.play_state = PlayState::Loop;
                            debug!(channel = idx, "channel entered loop");
                        }
                    }
                }
                PlayState::Loop => {
                    while ch.sample.position >= ch.sample.loop_end {
                        ch.sample.position -= ch.sample.loop_end - ch.sample.loop_start;
                    }
                }
                PlayState::Stop => return false,
            }
            true
        });
    }
}

impl<'a> Default for Mixer<'a> {
    fn default() -> Self {
        Self::new()
    }
}
