//! BSDIFF40 binary delta codec
//!
//! Forward-diff and patch application over byte vectors. The patch blob is
//! the classic BSDIFF40 layout: a 32-byte header followed by three bzip2
//! streams (control triples, diff bytes, extra bytes). The revision chain
//! stores these patches in reverse: applying a stored patch to the newer
//! content reconstructs the older one.

use std::io::Read;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;

use domla_common::error::{Error, Result};

const MAGIC: &[u8; 8] = b"BSDIFF40";
const HEADER_LEN: usize = 32;

/// Offsets are stored little-endian with the sign carried in bit 7 of the
/// last byte.
fn write_offset(x: i64, buf: &mut [u8]) {
    let mut y = x.unsigned_abs();
    for slot in buf.iter_mut().take(8) {
        *slot = (y & 0xff) as u8;
        y >>= 8;
    }
    if x < 0 {
        buf[7] |= 0x80;
    }
}

fn read_offset(buf: &[u8]) -> i64 {
    let mut y = i64::from(buf[7] & 0x7f);
    for index in (0..7).rev() {
        y = y * 256 + i64::from(buf[index]);
    }
    if buf[7] & 0x80 != 0 {
        -y
    } else {
        y
    }
}

/// One pass of the ternary-split quicksort used by qsufsort. Negative
/// entries in `i_arr` mark runs of already-sorted suffixes.
fn split(i_arr: &mut [i64], v: &mut [i64], start: i64, len: i64, h: i64) {
    if len < 16 {
        let mut k = start;
        while k < start + len {
            let mut j = 1i64;
            let mut x = v[(i_arr[k as usize] + h) as usize];
            let mut i = 1i64;
            while k + i < start + len {
                let candidate = v[(i_arr[(k + i) as usize] + h) as usize];
                if candidate < x {
                    x = candidate;
                    j = 0;
                }
                if candidate == x {
                    i_arr.swap((k + j) as usize, (k + i) as usize);
                    j += 1;
                }
                i += 1;
            }
            for idx in 0..j {
                v[i_arr[(k + idx) as usize] as usize] = k + j - 1;
            }
            if j == 1 {
                i_arr[k as usize] = -1;
            }
            k += j;
        }
        return;
    }

    let x = v[(i_arr[(start + len / 2) as usize] + h) as usize];
    let mut below = 0i64;
    let mut equal = 0i64;
    for i in start..start + len {
        let value = v[(i_arr[i as usize] + h) as usize];
        if value < x {
            below += 1;
        }
        if value == x {
            equal += 1;
        }
    }
    let jj = below + start;
    let kk = equal + jj;

    let mut i = start;
    let mut j = 0i64;
    let mut k = 0i64;
    while i < jj {
        let value = v[(i_arr[i as usize] + h) as usize];
        if value < x {
            i += 1;
        } else if value == x {
            i_arr.swap(i as usize, (jj + j) as usize);
            j += 1;
        } else {
            i_arr.swap(i as usize, (kk + k) as usize);
            k += 1;
        }
    }

    while jj + j < kk {
        if v[(i_arr[(jj + j) as usize] + h) as usize] == x {
            j += 1;
        } else {
            i_arr.swap((jj + j) as usize, (kk + k) as usize);
            k += 1;
        }
    }

    if jj > start {
        split(i_arr, v, start, jj - start, h);
    }

    for i in 0..kk - jj {
        v[i_arr[(jj + i) as usize] as usize] = kk - 1;
    }
    if jj == kk - 1 {
        i_arr[jj as usize] = -1;
    }

    if start + len > kk {
        split(i_arr, v, kk, start + len - kk, h);
    }
}

/// Suffix array construction (Larsson-Sadakane qsufsort): one bucket pass
/// over single bytes, then doubling rounds until every group is sorted.
fn qsufsort(i_arr: &mut [i64], v: &mut [i64], old: &[u8]) {
    let oldsize = old.len() as i64;
    let mut buckets = [0i64; 256];

    for &byte in old {
        buckets[byte as usize] += 1;
    }
    for i in 1..256 {
        buckets[i] += buckets[i - 1];
    }
    for i in (1..256).rev() {
        buckets[i] = buckets[i - 1];
    }
    buckets[0] = 0;

    for (index, &byte) in old.iter().enumerate() {
        buckets[byte as usize] += 1;
        i_arr[buckets[byte as usize] as usize] = index as i64;
    }
    i_arr[0] = oldsize;
    for (index, &byte) in old.iter().enumerate() {
        v[index] = buckets[byte as usize];
    }
    v[oldsize as usize] = 0;
    for i in 1..256 {
        if buckets[i] == buckets[i - 1] + 1 {
            i_arr[buckets[i] as usize] = -1;
        }
    }
    i_arr[0] = -1;

    let mut h = 1i64;
    while i_arr[0] != -(oldsize + 1) {
        let mut len = 0i64;
        let mut i = 0i64;
        while i < oldsize + 1 {
            if i_arr[i as usize] < 0 {
                len -= i_arr[i as usize];
                i -= i_arr[i as usize];
            } else {
                if len != 0 {
                    i_arr[(i - len) as usize] = -len;
                }
                let group = v[i_arr[i as usize] as usize] + 1 - i;
                split(i_arr, v, i, group, h);
                i += group;
                len = 0;
            }
        }
        if len != 0 {
            i_arr[(i - len) as usize] = -len;
        }
        h += h;
    }

    for i in 0..=oldsize {
        i_arr[v[i as usize] as usize] = i;
    }
}

fn match_len(old: &[u8], new: &[u8]) -> i64 {
    old.iter().zip(new).take_while(|(a, b)| a == b).count() as i64
}

/// Binary search over the suffix array for the longest prefix of `new`
/// matching somewhere in `old`. Returns (length, position in old).
fn search(i_arr: &[i64], old: &[u8], new: &[u8], st: i64, en: i64) -> (i64, i64) {
    if en - st < 2 {
        let x = match_len(&old[i_arr[st as usize] as usize..], new);
        let y = match_len(&old[i_arr[en as usize] as usize..], new);
        if x > y {
            (x, i_arr[st as usize])
        } else {
            (y, i_arr[en as usize])
        }
    } else {
        let mid = st + (en - st) / 2;
        let position = i_arr[mid as usize] as usize;
        let probe = std::cmp::min(old.len() - position, new.len());
        if old[position..position + probe] < new[..probe] {
            search(i_arr, old, new, mid, en)
        } else {
            search(i_arr, old, new, st, mid)
        }
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(data, Compression::best());
    let mut output = Vec::new();
    encoder
        .read_to_end(&mut output)
        .map_err(|e| Error::engine(format!("bzip compress: {e}"), -1))?;
    Ok(output)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::engine(format!("bzip decompress: {e}"), -1))?;
    Ok(output)
}

/// Compute a BSDIFF40 patch such that `apply_patch(old, patch) == new`.
pub fn create_patch(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    let oldsize = old.len() as i64;
    let newsize = new.len() as i64;

    let mut i_arr = vec![0i64; old.len() + 1];
    let mut v = vec![0i64; old.len() + 1];
    qsufsort(&mut i_arr, &mut v, old);
    drop(v);

    let mut diff_block: Vec<u8> = Vec::with_capacity(new.len());
    let mut extra_block: Vec<u8> = Vec::with_capacity(new.len());
    let mut control: Vec<u8> = Vec::new();

    let mut scan = 0i64;
    let mut len = 0i64;
    let mut pos = 0i64;
    let mut lastscan = 0i64;
    let mut lastpos = 0i64;
    let mut lastoffset = 0i64;

    while scan < newsize {
        let mut oldscore = 0i64;

        scan += len;
        let mut scsc = scan;
        while scan < newsize {
            let (found_len, found_pos) = search(&i_arr, old, &new[scan as usize..], 0, oldsize);
            len = found_len;
            pos = found_pos;

            while scsc < scan + len {
                if scsc + lastoffset < oldsize
                    && old[(scsc + lastoffset) as usize] == new[scsc as usize]
                {
                    oldscore += 1;
                }
                scsc += 1;
            }

            if (len == oldscore && len != 0) || (len > oldscore + 8) {
                break;
            }

            if scan + lastoffset < oldsize
                && old[(scan + lastoffset) as usize] == new[scan as usize]
            {
                oldscore -= 1;
            }
            scan += 1;
        }

        if len != oldscore || scan == newsize {
            // Extend the previous match forward while it keeps paying off.
            let mut s = 0i64;
            let mut best = 0i64;
            let mut lenf = 0i64;
            let mut i = 0i64;
            while lastscan + i < scan && lastpos + i < oldsize {
                if old[(lastpos + i) as usize] == new[(lastscan + i) as usize] {
                    s += 1;
                }
                i += 1;
                if s * 2 - i > best * 2 - lenf {
                    best = s;
                    lenf = i;
                }
            }

            // And the new match backwards, symmetrically.
            let mut lenb = 0i64;
            if scan < newsize {
                let mut s = 0i64;
                let mut best = 0i64;
                let mut i = 1i64;
                while scan >= lastscan + i && pos >= i {
                    if old[(pos - i) as usize] == new[(scan - i) as usize] {
                        s += 1;
                    }
                    if s * 2 - i > best * 2 - lenb {
                        best = s;
                        lenb = i;
                    }
                    i += 1;
                }
            }

            // Overlapping extensions fight for the split point.
            if lastscan + lenf > scan - lenb {
                let overlap = (lastscan + lenf) - (scan - lenb);
                let mut s = 0i64;
                let mut best = 0i64;
                let mut lens = 0i64;
                for i in 0..overlap {
                    if new[(lastscan + lenf - overlap + i) as usize]
                        == old[(lastpos + lenf - overlap + i) as usize]
                    {
                        s += 1;
                    }
                    if new[(scan - lenb + i) as usize] == old[(pos - lenb + i) as usize] {
                        s -= 1;
                    }
                    if s > best {
                        best = s;
                        lens = i + 1;
                    }
                }
                lenf += lens - overlap;
                lenb -= lens;
            }

            for i in 0..lenf {
                diff_block
                    .push(new[(lastscan + i) as usize].wrapping_sub(old[(lastpos + i) as usize]));
            }
            let extra_len = (scan - lenb) - (lastscan + lenf);
            for i in 0..extra_len {
                extra_block.push(new[(lastscan + lenf + i) as usize]);
            }

            let mut buf = [0u8; 8];
            write_offset(lenf, &mut buf);
            control.extend_from_slice(&buf);
            write_offset(extra_len, &mut buf);
            control.extend_from_slice(&buf);
            write_offset((pos - lenb) - (lastpos + lenf), &mut buf);
            control.extend_from_slice(&buf);

            lastscan = scan - lenb;
            lastpos = pos - lenb;
            lastoffset = pos - scan;
        }
    }

    let control_z = compress(&control)?;
    let diff_z = compress(&diff_block)?;
    let extra_z = compress(&extra_block)?;

    let mut patch = Vec::with_capacity(HEADER_LEN + control_z.len() + diff_z.len() + extra_z.len());
    patch.extend_from_slice(MAGIC);
    let mut buf = [0u8; 8];
    write_offset(control_z.len() as i64, &mut buf);
    patch.extend_from_slice(&buf);
    write_offset(diff_z.len() as i64, &mut buf);
    patch.extend_from_slice(&buf);
    write_offset(newsize, &mut buf);
    patch.extend_from_slice(&buf);
    patch.extend_from_slice(&control_z);
    patch.extend_from_slice(&diff_z);
    patch.extend_from_slice(&extra_z);

    Ok(patch)
}

/// Reconstruct the new bytes from `old` and a BSDIFF40 patch.
pub fn apply_patch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    if patch.len() <= HEADER_LEN {
        return Err(Error::Invalid("patch shorter than header".into()));
    }
    if &patch[0..8] != MAGIC {
        return Err(Error::Invalid("bad patch magic".into()));
    }

    let control_len = read_offset(&patch[8..16]);
    let diff_len = read_offset(&patch[16..24]);
    let new_size = read_offset(&patch[24..32]);
    if control_len < 0 || diff_len < 0 || new_size < 0 {
        return Err(Error::Invalid("negative length in patch header".into()));
    }

    let control_end = HEADER_LEN + control_len as usize;
    let diff_end = control_end + diff_len as usize;
    if diff_end > patch.len() {
        return Err(Error::Invalid("patch truncated".into()));
    }

    let control = decompress(&patch[HEADER_LEN..control_end])?;
    let diff_block = decompress(&patch[control_end..diff_end])?;
    let extra_block = decompress(&patch[diff_end..])?;

    let oldsize = old.len() as i64;
    let mut result = vec![0u8; new_size as usize];
    let mut oldpos = 0i64;
    let mut newpos = 0i64;
    let mut control_at = 0usize;
    let mut diff_at = 0usize;
    let mut extra_at = 0usize;

    while newpos < new_size {
        if control_at + 24 > control.len() {
            return Err(Error::Invalid("control block exhausted".into()));
        }
        let add_len = read_offset(&control[control_at..control_at + 8]);
        let copy_len = read_offset(&control[control_at + 8..control_at + 16]);
        let seek = read_offset(&control[control_at + 16..control_at + 24]);
        control_at += 24;

        if add_len < 0 || copy_len < 0 || newpos + add_len > new_size {
            return Err(Error::Invalid("control triple overruns output".into()));
        }
        if diff_at + add_len as usize > diff_block.len() {
            return Err(Error::Invalid("diff block exhausted".into()));
        }

        for i in 0..add_len {
            let mut byte = diff_block[diff_at + i as usize];
            let source = oldpos + i;
            // Reads past the old data contribute nothing to the sum.
            if source >= 0 && source < oldsize {
                byte = byte.wrapping_add(old[source as usize]);
            }
            result[(newpos + i) as usize] = byte;
        }
        diff_at += add_len as usize;
        newpos += add_len;
        oldpos += add_len;

        if newpos + copy_len > new_size {
            return Err(Error::Invalid("control triple overruns output".into()));
        }
        if extra_at + copy_len as usize > extra_block.len() {
            return Err(Error::Invalid("extra block exhausted".into()));
        }
        result[newpos as usize..(newpos + copy_len) as usize]
            .copy_from_slice(&extra_block[extra_at..extra_at + copy_len as usize]);
        extra_at += copy_len as usize;
        newpos += copy_len;
        oldpos += seek;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digits(n: usize) -> Vec<u8> {
        b"0123456789".iter().copied().cycle().take(n).collect()
    }

    #[test]
    fn patch_carries_magic() {
        let old = vec![0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let new = vec![9u8, 8, 7, 6, 5, 4, 3, 2, 1, 0];
        let patch = create_patch(&old, &new).unwrap();
        assert_eq!(&patch[0..8], b"BSDIFF40");
    }

    #[test]
    fn apply_patch_middle() {
        let old = digits(30);
        let mut new = digits(30);
        new[10..20].copy_from_slice(b"9876543210");

        let patch = create_patch(&old, &new).unwrap();
        assert_eq!(apply_patch(&old, &patch).unwrap(), new);
    }

    #[test]
    fn apply_patch_front() {
        let old = digits(30);
        let mut new = digits(30);
        new[0..10].copy_from_slice(b"9876543210");

        let patch = create_patch(&old, &new).unwrap();
        assert_eq!(apply_patch(&old, &patch).unwrap(), new);
    }

    #[test]
    fn apply_patch_tail() {
        let old = digits(30);
        let mut new = digits(30);
        new[20..30].copy_from_slice(b"9876543210");

        let patch = create_patch(&old, &new).unwrap();
        assert_eq!(apply_patch(&old, &patch).unwrap(), new);
    }

    #[test]
    fn empty_edges_are_legal() {
        let data = digits(16);

        let patch = create_patch(&[], &data).unwrap();
        assert_eq!(apply_patch(&[], &patch).unwrap(), data);

        let patch = create_patch(&data, &[]).unwrap();
        assert_eq!(apply_patch(&data, &patch).unwrap(), Vec::<u8>::new());

        let patch = create_patch(&[], &[]).unwrap();
        assert_eq!(&patch[0..8], b"BSDIFF40");
        assert_eq!(apply_patch(&[], &patch).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn identical_inputs_round_trip() {
        let data = digits(64);
        let patch = create_patch(&data, &data).unwrap();
        assert_eq!(apply_patch(&data, &patch).unwrap(), data);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let old = digits(10);
        let mut patch = create_patch(&old, &old).unwrap();
        patch[0] = b'X';
        assert!(matches!(
            apply_patch(&old, &patch),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn truncated_patch_is_rejected() {
        assert!(apply_patch(&[], &[0u8; 16]).is_err());
    }

    #[test]
    fn offsets_round_trip_including_negatives() {
        let mut buf = [0u8; 8];
        for value in [0i64, 1, -1, 255, -256, 65536, -65537, 1 << 40, -(1 << 40)] {
            write_offset(value, &mut buf);
            assert_eq!(read_offset(&buf), value, "{value}");
        }
    }

    proptest! {
        #[test]
        fn patch_round_trips_arbitrary_bytes(
            old in proptest::collection::vec(any::<u8>(), 0..300),
            new in proptest::collection::vec(any::<u8>(), 0..300),
        ) {
            let patch = create_patch(&old, &new).unwrap();
            prop_assert_eq!(apply_patch(&old, &patch).unwrap(), new);
        }
    }
}
