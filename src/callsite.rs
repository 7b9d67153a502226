use log::trace;

/// x86 direct near-call opcode.
const CALL_OPCODE: u8 = 0xE8;

/// Length of a direct near-call instruction: opcode plus 32-bit displacement.
pub const CALL_LEN: usize = 5;

/// Returns the offset inside `window` of the first `E8` call whose absolute
/// target equals `target`, or None.
///
/// `base` is the absolute address `window[0]` was read from; the displacement is
/// relative to the address right after the 5-byte instruction. There is no
/// instruction-boundary awareness here: a stray `E8` inside another
/// instruction's operands can in principle false-positive, which is why callers
/// keep the window tight and validate against a known target address. On a
/// target mismatch the whole 5-byte field is skipped before scanning resumes.
pub fn find_call_in(window: &[u8], base: usize, target: usize) -> Option<usize> {
    let mut i = 0;
    while i + CALL_LEN <= window.len() {
        if window[i] != CALL_OPCODE {
            i += 1;
            continue;
        }
        let displacement = i32::from_le_bytes([
            window[i + 1],
            window[i + 2],
            window[i + 3],
            window[i + 4],
        ]);
        let next = base.wrapping_add(i).wrapping_add(CALL_LEN);
        let destination = (next as isize).wrapping_add(displacement as isize) as usize;
        if destination == target {
            return Some(i);
        }
        i += CALL_LEN;
    }
    None
}

/// Scans `window` bytes forward from `base` for a direct call to `target` and
/// returns the absolute address of the call instruction.
///
/// # Safety
///
/// The caller must guarantee that `window` bytes starting at `base` are mapped
/// and readable.
pub unsafe fn find_call(base: usize, target: usize, window: usize) -> Option<usize> {
    trace!(
        "Scanning {:#x}+{:#x} for a call to {:#x}",
        base,
        window,
        target
    );
    let data = std::slice::from_raw_parts(base as *const u8, window);
    find_call_in(data, base, target).map(|offset| base + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an `E8` call at `at` inside `buffer` targeting absolute `target`,
    /// assuming the buffer starts at absolute address `base`.
    fn encode_call(buffer: &mut [u8], base: usize, at: usize, target: usize) {
        let next = base + at + CALL_LEN;
        let displacement = (target as isize - next as isize) as i32;
        buffer[at] = 0xE8;
        buffer[at + 1..at + 5].copy_from_slice(&displacement.to_le_bytes());
    }

    #[test]
    fn test_decodes_displacement() {
        let base = 0x10000;
        let target = 0x20000;
        let mut buffer = [0x90u8; 32];
        encode_call(&mut buffer, base, 7, target);
        assert_eq!(find_call_in(&buffer, base, target), Some(7));
    }

    #[test]
    fn test_backward_displacement() {
        let base = 0x40000;
        let target = 0x30000;
        let mut buffer = [0x90u8; 16];
        encode_call(&mut buffer, base, 2, target);
        assert_eq!(find_call_in(&buffer, base, target), Some(2));
    }

    #[test]
    fn test_rejects_off_by_one_target() {
        let base = 0x10000;
        let target = 0x20000;
        let mut buffer = [0x90u8; 32];
        encode_call(&mut buffer, base, 7, target);
        assert_eq!(find_call_in(&buffer, base, target + 1), None);
        assert_eq!(find_call_in(&buffer, base, target - 1), None);
    }

    #[test]
    fn test_skips_mismatched_call() {
        let base = 0x10000;
        let mut buffer = [0x90u8; 32];
        encode_call(&mut buffer, base, 0, 0x50000);
        encode_call(&mut buffer, base, 5, 0x60000);
        assert_eq!(find_call_in(&buffer, base, 0x60000), Some(5));
    }

    #[test]
    fn test_call_must_fit_in_window() {
        let base = 0x10000;
        let mut buffer = [0x90u8; 17];
        encode_call(&mut buffer, base, 12, 0x20000);
        // The instruction ends exactly at offset 17; a 16-byte window cuts it off.
        assert_eq!(find_call_in(&buffer[..16], base, 0x20000), None);
        assert_eq!(find_call_in(&buffer[..17], base, 0x20000), Some(12));
    }
}
