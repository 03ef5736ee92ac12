//! Requests and primitives: the units of work that flow through the
//! pipeline, and the tag that routes a backend I/O completion back to
//! its originating stage (spec §9, "tag-dispatched completion").

use crate::model::{Pba, Vba};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Sync,
}

/// A unique handle for a request accepted by the request pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// A client block request: `{ operation, starting VBA, block count,
/// opaque tag, offset }` (spec §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub operation: Operation,
    pub vba: Vba,
    pub count: u64,
    pub client_tag: u64,
    pub offset: u64,
}

impl Request {
    pub fn last_vba(&self) -> Vba {
        self.vba + self.count.saturating_sub(1)
    }
}

/// Identifies which stage generated a primitive, so a backend I/O
/// completion can be routed back to it without virtual dispatch (spec
/// §9: "model primitives as a tagged sum ... dispatch by tag_origin").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    Vbd,
    LeafRead,
    CryptoEncrypt,
    CryptoDecrypt,
    Cache,
    CacheFlush,
    WriteBack,
    SyncSb,
    FreeTreeWb,
    FreeTreeIo,
}

/// A single in-flight unit of work: one 4 KiB block operation tagged
/// with its originator, its current address, and (where it serves a
/// client request) the request that owns it.
///
/// The original design encodes request ownership in the same tag field
/// used for I/O completion routing; here the two are kept as separate
/// fields (`tag` for routing, `owner` for pool bookkeeping) since they
/// vary independently as a primitive moves through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Primitive {
    pub tag: Tag,
    pub owner: Option<RequestId>,
    pub operation: Operation,
    pub pba: Pba,
    pub vba: Vba,
    pub success: bool,
}

impl Primitive {
    pub fn new(tag: Tag, owner: Option<RequestId>, operation: Operation, pba: Pba, vba: Vba) -> Self {
        Self {
            tag,
            owner,
            operation,
            pba,
            vba,
            success: true,
        }
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}
