//! H.264 Annex-B helpers.

/// Coded slice of an IDR picture.
pub const NAL_IDR: u8 = 5;
/// Sequence parameter set.
pub const NAL_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_PPS: u8 = 8;

/// `nal_unit_type` of a NAL unit (low five bits of the header byte).
pub fn nal_type(nalu: &[u8]) -> Option<u8> {
    nalu.first().map(|b| b & 0x1F)
}

pub fn is_parameter_set(nalu: &[u8]) -> bool {
    matches!(nal_type(nalu), Some(NAL_SPS | NAL_PPS))
}

pub fn contains_idr(nalus: &[&[u8]]) -> bool {
    nalus.iter().any(|n| nal_type(n) == Some(NAL_IDR))
}

/// Split an Annex-B byte stream into NAL units.
///
/// Recognises both `00 00 01` and `00 00 00 01` start codes. Bytes before the
/// first start code are ignored and empty units are dropped. Trailing zero
/// bytes are stripped from each unit, since a NAL unit never ends in `0x00`
/// and the extra zero of a 4-byte start code lands there otherwise.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nalus = Vec::with_capacity(starts.len());
    for (k, &start) in starts.iter().enumerate() {
        let begin = start + 3;
        let mut end = starts.get(k + 1).copied().unwrap_or(data.len());
        while end > begin && data[end - 1] == 0 {
            end -= 1;
        }
        if end > begin {
            nalus.push(&data[begin..end]);
        }
    }
    nalus
}
