//! Reader for the UMOD binary pack format (`spec.md` §6).
//!
//! A [`Pack`] borrows the caller's byte slice for its entire lifetime: it
//! never copies sample data, pattern bytes, or song tables. All byte-offset
//! tables are validated once at [`Pack::load`]; everything read afterwards
//! (`song`, `pattern`, `instrument`) is a cheap slice reinterpretation.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"UMOD";
const HEADER_LEN: usize = 4 + 4 + 4 + 4;

/// Number of filler samples the packer appends past an instrument's `size`,
/// so the mixer's unrolled inner loop can read ahead without bounds checks.
pub const EXTRA_SAMPLES: usize = 64;

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(LittleEndian::read_u32)
        .ok_or(Error::IndexOutOfRange)
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(LittleEndian::read_u16)
        .ok_or(Error::IndexOutOfRange)
}

/// A song: an ordered list of pattern indices.
#[derive(Clone, Copy)]
pub struct SongView<'a> {
    data: &'a [u8],
    len: u16,
}

impl<'a> SongView<'a> {
    /// Number of pattern slots in this song's order list.
    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pattern index played at order position `pos`.
    pub fn pattern_index(&self, pos: u16) -> Result<u16> {
        if pos >= self.len {
            return Err(Error::IndexOutOfRange);
        }
        read_u16(self.data, 2 + pos as usize * 2)
    }
}

/// A pattern: a grid of `channels` x `rows` compact steps.
#[derive(Clone, Copy)]
pub struct PatternView<'a> {
    pub channels: u8,
    pub rows: u8,
    /// Raw compact step stream, positioned right after the `channels`/`rows`
    /// header bytes.
    pub steps: &'a [u8],
}

/// An instrument: header fields plus signed 8-bit PCM data (with the
/// [`EXTRA_SAMPLES`] read-ahead pad already appended by the packer).
#[derive(Clone, Copy)]
pub struct InstrumentView<'a> {
    pub size: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub default_frequency: u32,
    pub volume: u8,
    pub finetune: u8,
    /// `size + EXTRA_SAMPLES` bytes of signed 8-bit PCM.
    pub data: &'a [i8],
}

/// A loaded, validated UMOD pack. Borrows the caller's bytes for its whole
/// lifetime; the caller keeps them alive (`spec.md` §4.1: "No ownership
/// transfer").
pub struct Pack<'a> {
    data: &'a [u8],
    num_songs: u32,
    num_patterns: u32,
    num_instruments: u32,
    song_offsets: usize,
    pattern_offsets: usize,
    instrument_offsets: usize,
}

impl<'a> Pack<'a> {
    /// Parse and validate a pack's header and offset tables.
    pub fn load(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[0..4] != MAGIC {
            return Err(Error::BadMagic);
        }

        let num_songs = read_u32(data, 4)?;
        let num_patterns = read_u32(data, 8)?;
        let num_instruments = read_u32(data, 12)?;

        if num_instruments == 0 {
            return Err(Error::NoInstruments);
        }
        if num_songs > 0 && num_patterns == 0 {
            return Err(Error::SongsWithoutPatterns);
        }

        let song_offsets = HEADER_LEN;
        let pattern_offsets = song_offsets + num_songs as usize * 4;
        let instrument_offsets = pattern_offsets + num_patterns as usize * 4;
        let tables_end = instrument_offsets + num_instruments as usize * 4;

        if data.len() < tables_end {
            return Err(Error::IndexOutOfRange);
        }

        debug!(
            num_songs,
            num_patterns, num_instruments, "loaded UMOD pack"
        );

        Ok(Pack {
            data,
            num_songs,
            num_patterns,
            num_instruments,
            song_offsets,
            pattern_offsets,
            instrument_offsets,
        })
    }

    pub fn num_songs(&self) -> u32 {
        self.num_songs
    }

    pub fn num_patterns(&self) -> u32 {
        self.num_patterns
    }

    pub fn num_instruments(&self) -> u32 {
        self.num_instruments
    }

    fn table_offset(&self, table_start: usize, index: u32, count: u32) -> Result<u32> {
        if index >= count {
            return Err(Error::IndexOutOfRange);
        }
        read_u32(self.data, table_start + index as usize * 4)
    }

    pub fn song(&self, index: u32) -> Result<SongView<'a>> {
        let offset = self.table_offset(self.song_offsets, index, self.num_songs)? as usize;
        let len = read_u16(self.data, offset)?;
        let body = self
            .data
            .get(offset..)
            .ok_or(Error::IndexOutOfRange)?;
        Ok(SongView { data: body, len })
    }

    pub fn pattern(&self, index: u32) -> Result<PatternView<'a>> {
        let offset = self.table_offset(self.pattern_offsets, index, self.num_patterns)? as usize;
        let channels = *self.data.get(offset).ok_or(Error::IndexOutOfRange)?;
        let rows = *self.data.get(offset + 1).ok_or(Error::IndexOutOfRange)?;
        let steps = self.data.get(offset + 2..).ok_or(Error::IndexOutOfRange)?;
        Ok(PatternView {
            channels,
            rows,
            steps,
        })
    }

    pub fn instrument(&self, index: u32) -> Result<InstrumentView<'a>> {
        let offset =
            self.table_offset(self.instrument_offsets, index, self.num_instruments)? as usize;
        let size = read_u32(self.data, offset)?;
        let loop_start = read_u32(self.data, offset + 4)?;
        let loop_end = read_u32(self.data, offset + 8)?;
        let default_frequency = read_u32(self.data, offset + 12)?;
        let volume = *self.data.get(offset + 16).ok_or(Error::IndexOutOfRange)?;
        let finetune = *self.data.get(offset + 17).ok_or(Error::IndexOutOfRange)?;

        let pcm_start = offset + 18;
        let pcm_len = size as usize + EXTRA_SAMPLES;
        let pcm_bytes = self
            .data
            .get(pcm_start..pcm_start + pcm_len)
            .ok_or(Error::IndexOutOfRange)?;
        // SAFETY-free reinterpretation: i8 and u8 have identical layout, and
        // `&[u8]` -> `&[i8]` is a purely textual reinterpretation done here
        // via a byte-for-byte copy-free cast.
        let data = unsafe { &*(pcm_bytes as *const [u8] as *const [i8]) };

        Ok(InstrumentView {
            size,
            loop_start,
            loop_end,
            default_frequency,
            volume,
            finetune,
            data,
        })
    }
}

#[cfg(test)]
pub(crate) mod builder {
    //! Minimal in-memory pack assembler used by tests. Not part of the
    //! public API: real packs are produced by the external offline packer.

    pub struct PackBuilder {
        songs: Vec<Vec<u16>>,
        patterns: Vec<(u8, u8, Vec<u8>)>,
        instruments: Vec<Instrument>,
    }

    pub struct Instrument {
        pub loop_start: u32,
        pub loop_end: u32,
        pub default_frequency: u32,
        pub volume: u8,
        pub finetune: u8,
        pub data: Vec<i8>,
    }

    impl PackBuilder {
        pub fn new() -> Self {
            PackBuilder {
                songs: Vec::new(),
                patterns: Vec::new(),
                instruments: Vec::new(),
            }
        }

        pub fn add_song(&mut self, pattern_indices: Vec<u16>) -> u32 {
            self.songs.push(pattern_indices);
            (self.songs.len() - 1) as u32
        }

        pub fn add_pattern(&mut self, channels: u8, rows: u8, steps: Vec<u8>) -> u32 {
            self.patterns.push((channels, rows, steps));
            (self.patterns.len() - 1) as u32
        }

        pub fn add_instrument(&mut self, instrument: Instrument) -> u32 {
            self.instruments.push(instrument);
            (self.instruments.len() - 1) as u32
        }

        pub fn build(&self) -> Vec<u8> {
            use byteorder::{LittleEndian, WriteBytesExt};
            use std::io::Write;

            let mut song_bodies = Vec::new();
            for song in &self.songs {
                let mut body = Vec::new();
                body.write_u16::<LittleEndian>(song.len() as u16).unwrap();
                for p in song {
                    body.write_u16::<LittleEndian>(*p).unwrap();
                }
                song_bodies.push(body);
            }

            let mut pattern_bodies = Vec::new();
            for (channels, rows, steps) in &self.patterns {
                let mut body = Vec::new();
                body.push(*channels);
                body.push(*rows);
                body.write_all(steps).unwrap();
                pattern_bodies.push(body);
            }

            let mut instrument_bodies = Vec::new();
            for inst in &self.instruments {
                let mut body = Vec::new();
                body.write_u32::<LittleEndian>(inst.data.len() as u32)
                    .unwrap();
                body.write_u32::<LittleEndian>(inst.loop_start).unwrap();
                body.write_u32::<LittleEndian>(inst.loop_end).unwrap();
                body.write_u32::<LittleEndian>(inst.default_frequency)
                    .unwrap();
                body.push(inst.volume);
                body.push(inst.finetune);
                for s in &inst.data {
                    body.write_i8(*s).unwrap();
                }
                for _ in 0..super::EXTRA_SAMPLES {
                    body.write_i8(0).unwrap();
                }
                instrument_bodies.push(body);
            }

            let header_len = 16
                + song_bodies.len() * 4
                + pattern_bodies.len() * 4
                + instrument_bodies.len() * 4;

            let mut offset = header_len;
            let mut song_offsets = Vec::new();
            for body in &song_bodies {
                song_offsets.push(offset as u32);
                offset += body.len();
            }
            let mut pattern_offsets = Vec::new();
            for body in &pattern_bodies {
                pattern_offsets.push(offset as u32);
                offset += body.len();
            }
            let mut instrument_offsets = Vec::new();
            for body in &instrument_bodies {
                instrument_offsets.push(offset as u32);
                offset += body.len();
            }

            let mut out = Vec::new();
            out.extend_from_slice(b"UMOD");
            out.write_u32::<LittleEndian>(song_bodies.len() as u32)
                .unwrap();
            out.write_u32::<LittleEndian>(pattern_bodies.len() as u32)
                .unwrap();
            out.write_u32::<LittleEndian>(instrument_bodies.len() as u32)
                .unwrap();
            for o in &song_offsets {
                out.write_u32::<LittleEndian>(*o).unwrap();
            }
            for o in &pattern_offsets {
                out.write_u32::<LittleEndian>(*o).unwrap();
            }
            for o in &instrument_offsets {
                out.write_u32::<LittleEndian>(*o).unwrap();
            }
            for body in &song_bodies {
                out.write_all(body).unwrap();
            }
            for body in &pattern_bodies {
                out.write_all(body).unwrap();
            }
            for body in &instrument_bodies {
                out.write_all(body).unwrap();
            }

            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::builder::{Instrument, PackBuilder};
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = b"XXXX\0\0\0\0\0\0\0\0\0\0\0\0";
        assert_eq!(Pack::load(data), Err(Error::BadMagic));
    }

    #[test]
    fn rejects_no_instruments() {
        let mut builder = PackBuilder::new();
        builder.add_song(vec![0]);
        builder.add_pattern(1, 1, vec![0]);
        let data = builder.build();
        assert_eq!(Pack::load(&data), Err(Error::NoInstruments));
    }

    #[test]
    fn rejects_songs_without_patterns() {
        let mut builder = PackBuilder::new();
        builder.add_song(vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![0; 4],
        });
        let data = builder.build();
        assert_eq!(Pack::load(&data), Err(Error::SongsWithoutPatterns));
    }

    #[test]
    fn header_round_trip() {
        let mut builder = PackBuilder::new();
        builder.add_song(vec![0, 1]);
        builder.add_song(vec![0]);
        builder.add_pattern(1, 1, vec![0]);
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 4,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![1, 2, 3, 4],
        });
        let data = builder.build();
        let pack = Pack::load(&data).unwrap();
        assert_eq!(pack.num_songs(), 2);
        assert_eq!(pack.num_patterns(), 1);
        assert_eq!(pack.num_instruments(), 1);

        let song0 = pack.song(0).unwrap();
        assert_eq!(song0.len(), 2);
        assert_eq!(song0.pattern_index(0).unwrap(), 0);
        assert_eq!(song0.pattern_index(1).unwrap(), 1);

        let inst = pack.instrument(0).unwrap();
        assert_eq!(inst.size, 4);
        assert_eq!(inst.data.len(), 4 + EXTRA_SAMPLES);
        assert_eq!(&inst.data[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn instrument_index_out_of_range() {
        let mut builder = PackBuilder::new();
        builder.add_instrument(Instrument {
            loop_start: 0,
            loop_end: 0,
            default_frequency: 8363,
            volume: 255,
            finetune: 0,
            data: vec![0; 2],
        });
        let data = builder.build();
        let pack = Pack::load(&data).unwrap();
        assert_eq!(pack.instrument(1), Err(Error::IndexOutOfRange));
    }
}
