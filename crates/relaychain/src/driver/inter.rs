//! Intermediate drivers that work directly on the carrier stream.

use crate::direction::DirMask;
use crate::endpoint::{DataMethod, Stream};
use crate::error::OpenError;

use super::{AddressDesc, DescKind, OpenRequest};

pub(super) static DESCS: &[AddressDesc] = &[
    AddressDesc {
        keyword: "NOP",
        kind: DescKind::Inter,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::ALL,
        open: open_nop,
        args: [0; 3],
    },
    AddressDesc {
        keyword: "TEST",
        kind: DescKind::Inter,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::ALL,
        open: open_test,
        args: [b'>' as i32, 0, 0],
    },
    AddressDesc {
        keyword: "TESTREV",
        kind: DescKind::Inter,
        min_params: 0,
        max_params: 0,
        local_dirs: DirMask::ALL,
        net_dirs: DirMask::ALL,
        open: open_test,
        args: [b'<' as i32, 0, 0],
    },
];

fn open_nop(mut req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let carrier = req.take_carrier()?;
    Ok(carrier.renamed(req.keyword))
}

/// Marks every written block with the marker byte in `args[0]`.
fn open_test(mut req: OpenRequest<'_>) -> Result<Stream, OpenError> {
    let marker = u8::try_from(req.args[0])
        .map_err(|_| OpenError::no_retry(format!("{}: invalid marker", req.keyword)))?;
    let carrier = req.take_carrier()?;
    tracing::debug!(keyword = req.keyword, marker = %char::from(marker), "test mode");
    Ok(carrier.renamed(req.keyword).with_method(DataMethod::Test(marker)))
}
