//! Part-10 byte stream helpers shared by STOW ingestion and frame retrieval.

use dicom::object::{DefaultDicomObject, ReadError};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8] = b"DICM";

/// Drop the 128-byte preamble when one is present; `from_reader` expects the
/// stream to begin with the `DICM` magic code.
pub(crate) fn strip_preamble(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= PREAMBLE_LEN + MAGIC.len()
        && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] == MAGIC
    {
        &bytes[PREAMBLE_LEN..]
    } else {
        bytes
    }
}

/// Parse a Part-10 payload (with or without preamble) into a DICOM object.
pub(crate) fn read_object(bytes: &[u8]) -> Result<DefaultDicomObject, ReadError> {
    dicom::object::from_reader(strip_preamble(bytes))
}
