// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversion of length-prefixed HEVC data to Annex-B byte streams.

use crate::{Error, Result, TryVec};
use log::{debug, warn};

/// Fixed part of `HEVCDecoderConfigurationRecord` before the NAL unit arrays.
///
/// See ISO 14496-15:2017 § 8.3.3.1
const CONFIG_HEADER_SIZE: usize = 22;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

fn split_off<'a>(src: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8]> {
    if src.len() < len {
        return Err(Error::TruncatedConfig(what));
    }
    let (head, tail) = src.split_at(len);
    *src = tail;
    Ok(head)
}

fn be_u16(src: &mut &[u8], what: &'static str) -> Result<u16> {
    let bytes = split_off(src, 2, what)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Convert an `hvcC` payload to the parameter-set NAL units it carries, each
/// preceded by a 4-byte start code.
///
/// The header is skipped. Each array is a type byte and a 16-bit NAL count,
/// and each NAL is a 16-bit length followed by that many bytes. Array
/// boundaries are not kept, so `n` NALs with `L` payload bytes in total
/// produce `4n + L` bytes of output.
pub fn hvcc_to_annexb(config: &[u8]) -> Result<TryVec<u8>> {
    let mut src = config
        .get(CONFIG_HEADER_SIZE..)
        .ok_or(Error::TruncatedConfig("shorter than the configuration header"))?;
    let mut out = TryVec::with_capacity(config.len())?;

    let array_count = split_off(&mut src, 1, "missing array count")?[0];
    for _ in 0..array_count {
        let nal_type = split_off(&mut src, 1, "missing array type")?[0] & 0x3f;
        let nal_count = be_u16(&mut src, "missing NAL count")?;
        debug!("hvcC array of {nal_count} NAL units of type {nal_type}");

        for _ in 0..nal_count {
            let len = be_u16(&mut src, "missing NAL length")?;
            let nal = split_off(&mut src, usize::from(len), "NAL unit runs past the end")?;
            out.extend_from_slice(&START_CODE)?;
            out.extend_from_slice(nal)?;
        }
    }
    Ok(out)
}

/// Rewrite every 4-byte big-endian length prefix in `data` as a start code,
/// in place. Returns the number of prefixes rewritten.
///
/// A prefix that is cut short or whose length runs past the end stops the
/// walk; the bytes after it are passed through unchanged for the decoder to
/// judge.
pub(crate) fn length_prefixed_to_annexb(data: &mut [u8]) -> usize {
    let mut pos = 0;
    let mut count = 0;
    while pos < data.len() {
        let Some(prefix) = data.get_mut(pos..pos + 4) else {
            warn!("{} trailing bytes after NAL unit {count} are not a length prefix", data.len() - pos);
            break;
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        prefix.copy_from_slice(&START_CODE);
        count += 1;

        let next = usize::try_from(len)
            .ok()
            .and_then(|len| (pos + 4).checked_add(len))
            .filter(|&next| next <= data.len());
        let Some(next) = next else {
            warn!("NAL unit {count} claims {len} bytes, {} left", data.len() - pos - 4);
            break;
        };
        pos = next;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(arrays: &[&[&[u8]]]) -> std::vec::Vec<u8> {
        let mut config = vec![0u8; CONFIG_HEADER_SIZE];
        config.push(arrays.len() as u8);
        for (i, nals) in arrays.iter().enumerate() {
            config.push(0x20 + i as u8);
            config.extend_from_slice(&(nals.len() as u16).to_be_bytes());
            for nal in *nals {
                config.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                config.extend_from_slice(nal);
            }
        }
        config
    }

    #[test]
    fn single_nal() {
        let nal: &[u8] = &[0x40, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let array: &[&[u8]] = &[nal];
        let out = hvcc_to_annexb(&config_with(&[array])).unwrap();
        assert_eq!(out.len(), 14);
        assert_eq!(&out[..4], &START_CODE);
        assert_eq!(&out[4..], nal);
    }

    #[test]
    fn arrays_are_concatenated() {
        let vps: &[u8] = &[0x40, 0x01, 0xaa];
        let sps: &[u8] = &[0x42, 0x01];
        let pps: &[u8] = &[0x44, 0x01, 0xbb, 0xcc];
        let vps_array: &[&[u8]] = &[vps];
        let sps_array: &[&[u8]] = &[sps];
        let pps_array: &[&[u8]] = &[pps];
        let out = hvcc_to_annexb(&config_with(&[vps_array, sps_array, pps_array])).unwrap();
        assert_eq!(out.len(), 3 * 4 + vps.len() + sps.len() + pps.len());
        assert_eq!(&out[..], [
            0, 0, 0, 1, 0x40, 0x01, 0xaa, //
            0, 0, 0, 1, 0x42, 0x01, //
            0, 0, 0, 1, 0x44, 0x01, 0xbb, 0xcc,
        ]);
    }

    #[test]
    fn empty_arrays() {
        let out = hvcc_to_annexb(&config_with(&[])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn header_only_is_truncated() {
        assert!(matches!(hvcc_to_annexb(&[0; 22]), Err(Error::TruncatedConfig(_))));
        assert!(matches!(hvcc_to_annexb(&[0; 5]), Err(Error::TruncatedConfig(_))));
    }

    #[test]
    fn nal_past_end_is_truncated() {
        let nal: &[u8] = &[0x40, 0x01, 0x02];
        let array: &[&[u8]] = &[nal];
        let mut config = config_with(&[array]);
        config.pop();
        assert!(matches!(hvcc_to_annexb(&config), Err(Error::TruncatedConfig(_))));
    }

    #[test]
    fn slice_prefixes_become_start_codes() {
        let mut data = [0, 0, 0, 2, 0x26, 0x01, 0, 0, 0, 3, 0x02, 0x01, 0xff];
        assert_eq!(length_prefixed_to_annexb(&mut data), 2);
        assert_eq!(data, [0, 0, 0, 1, 0x26, 0x01, 0, 0, 0, 1, 0x02, 0x01, 0xff]);
    }

    #[test]
    fn slice_overrun_passes_through() {
        let mut data = [0, 0, 0, 9, 0x26, 0x01];
        assert_eq!(length_prefixed_to_annexb(&mut data), 1);
        assert_eq!(data, [0, 0, 0, 1, 0x26, 0x01]);

        let mut data = [0, 0, 0, 1, 0x26, 0, 0];
        assert_eq!(length_prefixed_to_annexb(&mut data), 1);
        assert_eq!(data, [0, 0, 0, 1, 0x26, 0, 0]);

        let mut data = [0, 0, 0, 2, 0x26, 0x01, 0, 0, 0, 7, 0x02];
        assert_eq!(length_prefixed_to_annexb(&mut data), 2);
        assert_eq!(data, [0, 0, 0, 1, 0x26, 0x01, 0, 0, 0, 1, 0x02]);
    }
}
