//! Incremental packet codec.
//!
//! There is no outer length prefix: each packet is self-describing (tag
//! byte + fields). Decoding therefore parses from the start of the buffer
//! and consumes nothing until a complete packet is present, so a packet
//! fragmented across any number of reads decodes identically.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packets::*;
use crate::{Packet, ProtocolError, MAX_DISC_JOBS, MAX_STRING_LEN};

/// Codec for framing `Packet` values over a byte stream.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Non-consuming reader over the front of the inbound buffer.
///
/// Every accessor returns `Ok(None)` when the buffer does not yet hold
/// enough bytes; the caller then returns `Ok(None)` from `decode` and the
/// whole parse is retried once more input arrives.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| {
            i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    /// i32 byte-length prefix + UTF-8 bytes.
    fn string(&mut self) -> Result<Option<String>, ProtocolError> {
        let Some(len) = self.i32() else {
            return Ok(None);
        };
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_STRING_LEN {
            return Err(ProtocolError::StringTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        let Some(bytes) = self.take(len) else {
            return Ok(None);
        };
        Ok(Some(String::from_utf8(bytes.to_vec())?))
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cur = Cursor::new(&src[..]);
        let Some(tag) = cur.u8() else {
            return Ok(None);
        };

        let packet = match tag {
            TAG_INIT | TAG_UPDT => {
                let (Some(potential), Some(sender)) = (cur.i32(), cur.i32()) else {
                    return Ok(None);
                };
                if tag == TAG_INIT {
                    Packet::Init { potential, sender }
                } else {
                    Packet::Updt { potential, sender }
                }
            }
            TAG_REQ => {
                let Some(job_id) = cur.i64() else {
                    return Ok(None);
                };
                let Some(artifact_url) = cur.string()? else {
                    return Ok(None);
                };
                let Some(entry_point) = cur.string()? else {
                    return Ok(None);
                };
                let (Some(start), Some(end)) = (cur.i64(), cur.i64()) else {
                    return Ok(None);
                };
                Packet::Req {
                    job_id,
                    artifact_url,
                    entry_point,
                    start,
                    end,
                }
            }
            TAG_ACC | TAG_REF => {
                let (Some(job_id), Some(start), Some(end)) = (cur.i64(), cur.i64(), cur.i64())
                else {
                    return Ok(None);
                };
                if tag == TAG_ACC {
                    Packet::Acc { job_id, start, end }
                } else {
                    Packet::Ref { job_id, start, end }
                }
            }
            TAG_ANS => {
                let (Some(job_id), Some(value)) = (cur.i64(), cur.i64()) else {
                    return Ok(None);
                };
                let Some(result) = cur.string()? else {
                    return Ok(None);
                };
                Packet::Ans {
                    job_id,
                    value,
                    result,
                }
            }
            TAG_REDI => {
                let Some(octets) = cur.take(4).map(|b| [b[0], b[1], b[2], b[3]]) else {
                    return Ok(None);
                };
                let Some(port) = cur.u16() else {
                    return Ok(None);
                };
                Packet::Redi {
                    new_parent: std::net::SocketAddrV4::new(octets.into(), port),
                }
            }
            TAG_DISC => {
                let (Some(expected_reconnects), Some(nb_jobs)) = (cur.i32(), cur.i32()) else {
                    return Ok(None);
                };
                if nb_jobs < 0 {
                    return Err(ProtocolError::NegativeLength(nb_jobs));
                }
                let nb_jobs = nb_jobs as usize;
                if nb_jobs > MAX_DISC_JOBS {
                    return Err(ProtocolError::JobListTooLong {
                        len: nb_jobs,
                        max: MAX_DISC_JOBS,
                    });
                }
                let mut jobs = Vec::with_capacity(nb_jobs);
                for _ in 0..nb_jobs {
                    let (Some(job_id), Some(new_upstream)) = (cur.i64(), cur.i32()) else {
                        return Ok(None);
                    };
                    jobs.push(DiscJob {
                        job_id,
                        new_upstream,
                    });
                }
                Packet::Disc {
                    expected_reconnects,
                    jobs,
                }
            }
            TAG_OK_DISC => Packet::OkDisc,
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        packet.validate()?;
        let consumed = cur.pos;
        src.advance(consumed);
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;
        dst.put_u8(item.tag());
        match item {
            Packet::Init { potential, sender } | Packet::Updt { potential, sender } => {
                dst.put_i32(potential);
                dst.put_i32(sender);
            }
            Packet::Req {
                job_id,
                artifact_url,
                entry_point,
                start,
                end,
            } => {
                dst.put_i64(job_id);
                put_string(dst, &artifact_url)?;
                put_string(dst, &entry_point)?;
                dst.put_i64(start);
                dst.put_i64(end);
            }
            Packet::Acc { job_id, start, end } | Packet::Ref { job_id, start, end } => {
                dst.put_i64(job_id);
                dst.put_i64(start);
                dst.put_i64(end);
            }
            Packet::Ans {
                job_id,
                value,
                result,
            } => {
                dst.put_i64(job_id);
                dst.put_i64(value);
                put_string(dst, &result)?;
            }
            Packet::Redi { new_parent } => {
                dst.put_slice(&new_parent.ip().octets());
                dst.put_u16(new_parent.port());
            }
            Packet::Disc {
                expected_reconnects,
                jobs,
            } => {
                if jobs.len() > MAX_DISC_JOBS {
                    return Err(ProtocolError::JobListTooLong {
                        len: jobs.len(),
                        max: MAX_DISC_JOBS,
                    });
                }
                dst.put_i32(expected_reconnects);
                dst.put_i32(jobs.len() as i32);
                for job in jobs {
                    dst.put_i64(job.job_id);
                    dst.put_i32(job.new_upstream);
                }
            }
            Packet::OkDisc => {}
        }
        Ok(())
    }
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong {
            len: s.len(),
            max: MAX_STRING_LEN,
        });
    }
    dst.put_i32(s.len() as i32);
    dst.put_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::Init {
                potential: 3,
                sender: 0x1234,
            },
            Packet::Updt {
                potential: 7,
                sender: -42,
            },
            Packet::Req {
                job_id: 99,
                artifact_url: "http://example.org/collatz.so".into(),
                entry_point: "collatz".into(),
                start: 0,
                end: 5000,
            },
            Packet::Acc {
                job_id: 99,
                start: 10,
                end: 20,
            },
            Packet::Ref {
                job_id: 99,
                start: 15,
                end: 20,
            },
            Packet::Ans {
                job_id: 99,
                value: 17,
                result: "17 reaches 1 in 12 steps".into(),
            },
            Packet::Redi {
                new_parent: "192.168.1.7:7777".parse().unwrap(),
            },
            Packet::Disc {
                expected_reconnects: 2,
                jobs: vec![
                    DiscJob {
                        job_id: 99,
                        new_upstream: 0x5678,
                    },
                    DiscJob {
                        job_id: 100,
                        new_upstream: -3,
                    },
                ],
            },
            Packet::OkDisc,
        ]
    }

    #[test]
    fn roundtrip_every_kind() {
        let mut codec = PacketCodec;
        for packet in sample_packets() {
            let mut buf = BytesMut::new();
            codec.encode(packet.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, packet);
            assert!(buf.is_empty(), "decode must consume the full frame");
        }
    }

    #[test]
    fn back_to_back_packets() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        let packets = sample_packets();
        for packet in &packets {
            codec.encode(packet.clone(), &mut buf).unwrap();
        }
        for packet in &packets {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, packet);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    /// Delivering the bytes split at every possible boundary must produce
    /// the same packet, with no intermediate error.
    #[test]
    fn fragmentation_invariance() {
        let mut codec = PacketCodec;
        for packet in sample_packets() {
            let mut full = BytesMut::new();
            codec.encode(packet.clone(), &mut full).unwrap();
            let bytes = full.to_vec();

            for split in 0..=bytes.len() {
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&bytes[..split]);
                if split < bytes.len() {
                    assert!(
                        codec.decode(&mut buf).unwrap().is_none(),
                        "partial frame of {} at {} must not decode",
                        packet.kind(),
                        split
                    );
                }
                buf.extend_from_slice(&bytes[split..]);
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(decoded, packet);
            }
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownTag(0xFF))
        ));
    }

    #[test]
    fn negative_string_length_is_an_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ANS);
        buf.put_i64(1);
        buf.put_i64(0);
        buf.put_i32(-4);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::NegativeLength(-4))
        ));
    }

    #[test]
    fn oversized_string_is_an_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ANS);
        buf.put_i64(1);
        buf.put_i64(0);
        buf.put_i32((MAX_STRING_LEN + 1) as i32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::StringTooLong { .. })
        ));
    }

    #[test]
    fn inverted_range_is_an_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_REF);
        buf.put_i64(1);
        buf.put_i64(50);
        buf.put_i64(10);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedRange { start: 50, end: 10 })
        ));
    }

    #[test]
    fn negative_disc_job_count_is_an_error() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_DISC);
        buf.put_i32(1);
        buf.put_i32(-1);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::NegativeLength(-1))
        ));
    }

    fn arb_string() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ./:_-]{0,64}"
    }

    fn arb_range() -> impl Strategy<Value = (i64, i64)> {
        (0i64..1_000_000, 0i64..1_000_000)
            .prop_map(|(a, b)| (a.min(b), a.max(b)))
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            (0i32..i32::MAX, any::<i32>())
                .prop_map(|(potential, sender)| Packet::Init { potential, sender }),
            (0i32..i32::MAX, any::<i32>())
                .prop_map(|(potential, sender)| Packet::Updt { potential, sender }),
            (0i64..i64::MAX, arb_string(), arb_string(), arb_range()).prop_map(
                |(job_id, artifact_url, entry_point, (start, end))| Packet::Req {
                    job_id,
                    artifact_url,
                    entry_point,
                    start,
                    end,
                }
            ),
            (0i64..i64::MAX, arb_range())
                .prop_map(|(job_id, (start, end))| Packet::Acc { job_id, start, end }),
            (0i64..i64::MAX, arb_range())
                .prop_map(|(job_id, (start, end))| Packet::Ref { job_id, start, end }),
            (0i64..i64::MAX, any::<i64>(), arb_string()).prop_map(|(job_id, value, result)| {
                Packet::Ans {
                    job_id,
                    value,
                    result,
                }
            }),
            (any::<[u8; 4]>(), any::<u16>()).prop_map(|(ip, port)| Packet::Redi {
                new_parent: std::net::SocketAddrV4::new(ip.into(), port),
            }),
            (
                0i32..1024,
                prop::collection::vec(
                    (0i64..i64::MAX, any::<i32>()).prop_map(|(job_id, new_upstream)| DiscJob {
                        job_id,
                        new_upstream,
                    }),
                    0..8
                )
            )
                .prop_map(|(expected_reconnects, jobs)| Packet::Disc {
                    expected_reconnects,
                    jobs,
                }),
            Just(Packet::OkDisc),
        ]
    }

    proptest! {
        #[test]
        fn prop_roundtrip(packet in arb_packet()) {
            let mut codec = PacketCodec;
            let mut buf = BytesMut::new();
            codec.encode(packet.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, packet);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_roundtrip_fragmented(packet in arb_packet(), split in any::<prop::sample::Index>()) {
            let mut codec = PacketCodec;
            let mut full = BytesMut::new();
            codec.encode(packet.clone(), &mut full).unwrap();
            let bytes = full.to_vec();
            let at = split.index(bytes.len() + 1);

            let mut buf = BytesMut::new();
            buf.extend_from_slice(&bytes[..at]);
            if at < bytes.len() {
                prop_assert!(codec.decode(&mut buf).unwrap().is_none());
            }
            buf.extend_from_slice(&bytes[at..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
