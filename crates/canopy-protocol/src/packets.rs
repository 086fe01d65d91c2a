//! Packet types for the canopy tree protocol.
//!
//! Nine kinds, one leading tag byte each. Topology packets (INIT/UPDT)
//! carry the sender's node id so an accepting parent can recognise a
//! reconnecting grandchild; job packets are keyed by job id; leave packets
//! (DISC/REDI/OK_DISC) drive the graceful-departure protocol.

use std::net::SocketAddrV4;

use crate::ProtocolError;

/// One entry of a DISC packet: a downstream job and the node id its new
/// upstream will reconnect from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscJob {
    pub job_id: i64,
    pub new_upstream: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// First packet on an accepted link: the acceptor's current potential
    /// and node id.
    Init { potential: i32, sender: i32 },
    /// Potential update: the value of the tree as seen through this link,
    /// excluding the receiver's own branch.
    Updt { potential: i32, sender: i32 },
    /// Offer of a sub-range of a job to the receiving node.
    Req {
        job_id: i64,
        artifact_url: String,
        entry_point: String,
        start: i64,
        end: i64,
    },
    /// The receiver of a REQ accepted the offered range.
    Acc { job_id: i64, start: i64, end: i64 },
    /// A range is handed back to the offering node for local execution.
    Ref { job_id: i64, start: i64, end: i64 },
    /// One computed answer.
    Ans {
        job_id: i64,
        value: i64,
        result: String,
    },
    /// Sent by a leaving node to its children: reconnect to this address.
    Redi { new_parent: SocketAddrV4 },
    /// Sent by a leaving node to its parent: how many grandchildren will
    /// reconnect, and which jobs must be rerouted to which of them.
    Disc {
        expected_reconnects: i32,
        jobs: Vec<DiscJob>,
    },
    /// Acknowledgement of a DISC or REDI.
    OkDisc,
}

pub(crate) const TAG_INIT: u8 = 1;
pub(crate) const TAG_UPDT: u8 = 2;
pub(crate) const TAG_REQ: u8 = 3;
pub(crate) const TAG_ACC: u8 = 4;
pub(crate) const TAG_REF: u8 = 5;
pub(crate) const TAG_ANS: u8 = 6;
pub(crate) const TAG_REDI: u8 = 7;
pub(crate) const TAG_DISC: u8 = 8;
pub(crate) const TAG_OK_DISC: u8 = 9;

impl Packet {
    /// Wire tag for this packet kind.
    pub fn tag(&self) -> u8 {
        match self {
            Packet::Init { .. } => TAG_INIT,
            Packet::Updt { .. } => TAG_UPDT,
            Packet::Req { .. } => TAG_REQ,
            Packet::Acc { .. } => TAG_ACC,
            Packet::Ref { .. } => TAG_REF,
            Packet::Ans { .. } => TAG_ANS,
            Packet::Redi { .. } => TAG_REDI,
            Packet::Disc { .. } => TAG_DISC,
            Packet::OkDisc => TAG_OK_DISC,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Init { .. } => "INIT",
            Packet::Updt { .. } => "UPDT",
            Packet::Req { .. } => "REQ",
            Packet::Acc { .. } => "ACC",
            Packet::Ref { .. } => "REF",
            Packet::Ans { .. } => "ANS",
            Packet::Redi { .. } => "REDI",
            Packet::Disc { .. } => "DISC",
            Packet::OkDisc => "OK_DISC",
        }
    }

    /// Field-level validation, applied on decode and available to senders.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match *self {
            Packet::Init { potential, .. } | Packet::Updt { potential, .. } => {
                if potential < 0 {
                    return Err(ProtocolError::NegativePotential(potential));
                }
            }
            Packet::Req {
                job_id, start, end, ..
            }
            | Packet::Acc { job_id, start, end }
            | Packet::Ref { job_id, start, end } => {
                if job_id < 0 {
                    return Err(ProtocolError::NegativeJobId(job_id));
                }
                // The width must fit i64 or every per-range counter
                // downstream wraps.
                if start > end || end.checked_sub(start).is_none() {
                    return Err(ProtocolError::MalformedRange { start, end });
                }
            }
            Packet::Ans { job_id, .. } => {
                if job_id < 0 {
                    return Err(ProtocolError::NegativeJobId(job_id));
                }
            }
            Packet::Disc {
                expected_reconnects,
                ref jobs,
            } => {
                if expected_reconnects < 0 {
                    return Err(ProtocolError::NegativeLength(expected_reconnects));
                }
                for job in jobs {
                    if job.job_id < 0 {
                        return Err(ProtocolError::NegativeJobId(job.job_id));
                    }
                }
            }
            Packet::Redi { .. } | Packet::OkDisc => {}
        }
        Ok(())
    }
}
