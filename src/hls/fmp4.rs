//! Fragmented MP4 box writer for a single H.264 video track.
//!
//! Produces the CMAF-style init segment (`ftyp` + `moov`) and one
//! `moof`/`mdat` pair per HLS part. Timescale is fixed at 90 kHz so decode
//! times can be taken straight from the MPEG-TS style clock.

use bytes::Bytes;

/// Track timescale (ticks per second).
pub const TIMESCALE: u32 = 90_000;

const TRACK_ID: u32 = 1;

/// Parameters needed to describe the video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Track {
    pub sps: Bytes,
    pub pps: Bytes,
    pub width: u16,
    pub height: u16,
}

impl H264Track {
    /// RFC 6381 codec string, e.g. `avc1.42C01F`.
    pub fn codec(&self) -> String {
        match self.sps.get(1..4) {
            Some(&[profile, compat, level]) => {
                format!("avc1.{profile:02X}{compat:02X}{level:02X}")
            }
            _ => "avc1.42E01E".to_string(),
        }
    }
}

/// One access unit in AVCC (length-prefixed) form.
#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    /// Duration in [`TIMESCALE`] ticks.
    pub duration: u32,
    pub keyframe: bool,
}

/// Convert Annex-B NAL units into a 4-byte length-prefixed sample payload.
/// Returns `None` if a unit is larger than a 32-bit length can express.
pub fn avcc_payload(nalus: &[&[u8]]) -> Option<Bytes> {
    let total: usize = nalus.iter().map(|n| n.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nalus {
        let len = u32::try_from(nal.len()).ok()?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(nal);
    }
    Some(Bytes::from(out))
}

/// `ftyp` + `moov` describing the track, with an empty sample table and a
/// `mvex` so players expect movie fragments.
pub fn init_segment(track: &H264Track) -> Bytes {
    let mut buf = Vec::new();
    write_box(&mut buf, b"ftyp", |ftyp| {
        ftyp.extend_from_slice(b"iso5");
        ftyp.extend_from_slice(&0x0000_0200u32.to_be_bytes());
        ftyp.extend_from_slice(b"iso5iso6mp41cmfc");
    });

    write_box(&mut buf, b"moov", |moov| {
        write_full_box(moov, b"mvhd", 0, 0, |mvhd| {
            mvhd.extend_from_slice(&0u32.to_be_bytes()); // creation time
            mvhd.extend_from_slice(&0u32.to_be_bytes()); // modification time
            mvhd.extend_from_slice(&TIMESCALE.to_be_bytes());
            mvhd.extend_from_slice(&0u32.to_be_bytes()); // duration
            mvhd.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
            mvhd.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
            mvhd.extend_from_slice(&[0u8; 10]);
            mvhd.extend_from_slice(&IDENTITY_MATRIX);
            mvhd.extend_from_slice(&[0u8; 24]); // pre-defined
            mvhd.extend_from_slice(&(TRACK_ID + 1).to_be_bytes()); // next track id
        });

        write_box(moov, b"trak", |trak| {
            // enabled | in movie | in preview
            write_full_box(trak, b"tkhd", 0, 0x07, |tkhd| {
                tkhd.extend_from_slice(&0u32.to_be_bytes());
                tkhd.extend_from_slice(&0u32.to_be_bytes());
                tkhd.extend_from_slice(&TRACK_ID.to_be_bytes());
                tkhd.extend_from_slice(&0u32.to_be_bytes()); // reserved
                tkhd.extend_from_slice(&0u32.to_be_bytes()); // duration
                tkhd.extend_from_slice(&[0u8; 8]);
                tkhd.extend_from_slice(&0u16.to_be_bytes()); // layer
                tkhd.extend_from_slice(&0u16.to_be_bytes()); // alternate group
                tkhd.extend_from_slice(&0u16.to_be_bytes()); // volume
                tkhd.extend_from_slice(&0u16.to_be_bytes());
                tkhd.extend_from_slice(&IDENTITY_MATRIX);
                tkhd.extend_from_slice(&(u32::from(track.width) << 16).to_be_bytes());
                tkhd.extend_from_slice(&(u32::from(track.height) << 16).to_be_bytes());
            });

            write_box(trak, b"mdia", |mdia| {
                write_full_box(mdia, b"mdhd", 0, 0, |mdhd| {
                    mdhd.extend_from_slice(&0u32.to_be_bytes());
                    mdhd.extend_from_slice(&0u32.to_be_bytes());
                    mdhd.extend_from_slice(&TIMESCALE.to_be_bytes());
                    mdhd.extend_from_slice(&0u32.to_be_bytes());
                    mdhd.extend_from_slice(&0x55C4u16.to_be_bytes()); // 'und'
                    mdhd.extend_from_slice(&0u16.to_be_bytes());
                });

                write_full_box(mdia, b"hdlr", 0, 0, |hdlr| {
                    hdlr.extend_from_slice(&0u32.to_be_bytes());
                    hdlr.extend_from_slice(b"vide");
                    hdlr.extend_from_slice(&[0u8; 12]);
                    hdlr.extend_from_slice(b"VideoHandler\0");
                });

                write_box(mdia, b"minf", |minf| {
                    write_full_box(minf, b"vmhd", 0, 1, |vmhd| {
                        vmhd.extend_from_slice(&[0u8; 8]);
                    });

                    write_box(minf, b"dinf", |dinf| {
                        write_full_box(dinf, b"dref", 0, 0, |dref| {
                            dref.extend_from_slice(&1u32.to_be_bytes());
                            // self-contained
                            write_full_box(dref, b"url ", 0, 1, |_| {});
                        });
                    });

                    write_box(minf, b"stbl", |stbl| {
                        write_full_box(stbl, b"stsd", 0, 0, |stsd| {
                            stsd.extend_from_slice(&1u32.to_be_bytes());
                            write_avc1(stsd, track);
                        });
                        for kind in [b"stts", b"stsc", b"stco"] {
                            write_full_box(stbl, kind, 0, 0, |b| {
                                b.extend_from_slice(&0u32.to_be_bytes());
                            });
                        }
                        write_full_box(stbl, b"stsz", 0, 0, |stsz| {
                            stsz.extend_from_slice(&0u32.to_be_bytes()); // sample size
                            stsz.extend_from_slice(&0u32.to_be_bytes()); // sample count
                        });
                    });
                });
            });
        });

        write_box(moov, b"mvex", |mvex| {
            write_full_box(mvex, b"trex", 0, 0, |trex| {
                trex.extend_from_slice(&TRACK_ID.to_be_bytes());
                trex.extend_from_slice(&1u32.to_be_bytes()); // sample description index
                trex.extend_from_slice(&0u32.to_be_bytes()); // default duration
                trex.extend_from_slice(&0u32.to_be_bytes()); // default size
                trex.extend_from_slice(&0u32.to_be_bytes()); // default flags
            });
        });
    });

    Bytes::from(buf)
}

fn write_avc1(stsd: &mut Vec<u8>, track: &H264Track) {
    write_box(stsd, b"avc1", |avc1| {
        avc1.extend_from_slice(&[0u8; 6]);
        avc1.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        avc1.extend_from_slice(&[0u8; 16]);
        avc1.extend_from_slice(&track.width.to_be_bytes());
        avc1.extend_from_slice(&track.height.to_be_bytes());
        avc1.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
        avc1.extend_from_slice(&0x0048_0000u32.to_be_bytes());
        avc1.extend_from_slice(&0u32.to_be_bytes());
        avc1.extend_from_slice(&1u16.to_be_bytes()); // frame count
        avc1.extend_from_slice(&[0u8; 32]); // compressor name
        avc1.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
        avc1.extend_from_slice(&0xFFFFu16.to_be_bytes());

        write_box(avc1, b"avcC", |avcc| {
            avcc.push(1);
            avcc.push(track.sps.get(1).copied().unwrap_or(0x42));
            avcc.push(track.sps.get(2).copied().unwrap_or(0));
            avcc.push(track.sps.get(3).copied().unwrap_or(0x1E));
            avcc.push(0xFF); // 4-byte NAL lengths
            avcc.push(0xE1); // one SPS
            push_u16_prefixed(avcc, &track.sps);
            avcc.push(1); // one PPS
            push_u16_prefixed(avcc, &track.pps);
        });
    });
}

fn push_u16_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&data[..usize::from(len)]);
}

/// One `moof` + `mdat` carrying `samples`, starting at `base_decode_time`.
pub fn fragment(sequence_number: u32, base_decode_time: u64, samples: &[Sample]) -> Bytes {
    let mfhd = build_box(b"mfhd", |mfhd| {
        mfhd.extend_from_slice(&[0, 0, 0, 0]);
        mfhd.extend_from_slice(&sequence_number.to_be_bytes());
    });

    // default-base-is-moof
    let tfhd = build_box(b"tfhd", |tfhd| {
        tfhd.extend_from_slice(&[0, 0x02, 0x00, 0x00]);
        tfhd.extend_from_slice(&TRACK_ID.to_be_bytes());
    });

    let tfdt = build_box(b"tfdt", |tfdt| {
        tfdt.extend_from_slice(&[1, 0, 0, 0]); // version 1: 64-bit time
        tfdt.extend_from_slice(&base_decode_time.to_be_bytes());
    });

    // data-offset | sample-duration | sample-size | sample-flags
    let trun_flags: u32 = 0x0000_0001 | 0x0000_0100 | 0x0000_0200 | 0x0000_0400;
    let trun_len = 8 + 4 + 4 + 4 + samples.len() * 12;
    let moof_len = 8 + mfhd.len() + 8 + tfhd.len() + tfdt.len() + trun_len;
    let data_offset = u32::try_from(moof_len + 8).unwrap_or(u32::MAX);

    let trun = build_box(b"trun", |trun| {
        trun.extend_from_slice(&trun_flags.to_be_bytes());
        trun.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        trun.extend_from_slice(&data_offset.to_be_bytes());
        for sample in samples {
            trun.extend_from_slice(&sample.duration.to_be_bytes());
            trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
            let flags: u32 = if sample.keyframe {
                0x0200_0000
            } else {
                0x0101_0000
            };
            trun.extend_from_slice(&flags.to_be_bytes());
        }
    });

    let mut out = Vec::with_capacity(moof_len + 8 + samples.iter().map(|s| s.data.len()).sum::<usize>());
    write_box(&mut out, b"moof", |moof| {
        moof.extend_from_slice(&mfhd);
        write_box(moof, b"traf", |traf| {
            traf.extend_from_slice(&tfhd);
            traf.extend_from_slice(&tfdt);
            traf.extend_from_slice(&trun);
        });
    });
    write_box(&mut out, b"mdat", |mdat| {
        for sample in samples {
            mdat.extend_from_slice(&sample.data);
        }
    });
    Bytes::from(out)
}

fn write_box<F>(buf: &mut Vec<u8>, kind: &[u8; 4], build: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut content = Vec::new();
    build(&mut content);
    let size = (content.len() + 8) as u32;
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(kind);
    buf.extend_from_slice(&content);
}

fn write_full_box<F>(buf: &mut Vec<u8>, kind: &[u8; 4], version: u8, flags: u32, build: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    write_box(buf, kind, |b| {
        b.push(version);
        b.extend_from_slice(&flags.to_be_bytes()[1..]);
        build(b);
    });
}

fn build_box<F>(kind: &[u8; 4], build: F) -> Vec<u8>
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut out = Vec::new();
    write_box(&mut out, kind, build);
    out
}

const IDENTITY_MATRIX: [u8; 36] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> H264Track {
        H264Track {
            sps: Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D]),
            pps: Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
            width: 1280,
            height: 720,
        }
    }

    /// Top-level boxes as `(kind, size)`.
    fn top_level(buf: &[u8]) -> Vec<([u8; 4], usize)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= buf.len() {
            let size = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let kind: [u8; 4] = buf[pos + 4..pos + 8].try_into().unwrap();
            out.push((kind, size));
            pos += size;
        }
        assert_eq!(pos, buf.len(), "box sizes must cover the buffer exactly");
        out
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn test_init_segment_layout() {
        let init = init_segment(&track());
        let boxes = top_level(&init);
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].0, b"ftyp");
        assert_eq!(&boxes[1].0, b"moov");

        let avcc = find(&init, b"avcC").unwrap();
        // version, profile, compat, level copied from the SPS
        assert_eq!(&init[avcc + 4..avcc + 8], &[1, 0x42, 0xC0, 0x1F]);
        assert!(find(&init, &[0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D]).is_some());
        assert!(find(&init, b"mvex").is_some());
    }

    #[test]
    fn test_fragment_data_offset_points_at_mdat_payload() {
        let samples = [
            Sample {
                data: avcc_payload(&[&[0x65, 0x88, 0x84]]).unwrap(),
                duration: 3000,
                keyframe: true,
            },
            Sample {
                data: avcc_payload(&[&[0x41, 0x9A]]).unwrap(),
                duration: 3000,
                keyframe: false,
            },
        ];
        let frag = fragment(7, 90_000, &samples);
        let boxes = top_level(&frag);
        assert_eq!(&boxes[0].0, b"moof");
        assert_eq!(&boxes[1].0, b"mdat");

        let trun = find(&frag, b"trun").unwrap();
        let offset_pos = trun + 4 + 4 + 4;
        let data_offset =
            u32::from_be_bytes(frag[offset_pos..offset_pos + 4].try_into().unwrap()) as usize;
        assert_eq!(data_offset, boxes[0].1 + 8);
        assert_eq!(&frag[data_offset..data_offset + 7], &[0, 0, 0, 3, 0x65, 0x88, 0x84]);

        let tfdt = find(&frag, b"tfdt").unwrap();
        let decode_time = u64::from_be_bytes(frag[tfdt + 8..tfdt + 16].try_into().unwrap());
        assert_eq!(decode_time, 90_000);
    }

    #[test]
    fn test_avcc_payload_prefixes_lengths() {
        let payload = avcc_payload(&[&[1, 2], &[3]]).unwrap();
        assert_eq!(&payload[..], &[0, 0, 0, 2, 1, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn test_codec_string() {
        assert_eq!(track().codec(), "avc1.42C01F");
        let short = H264Track {
            sps: Bytes::from_static(&[0x67]),
            ..track()
        };
        assert_eq!(short.codec(), "avc1.42E01E");
    }
}
