use super::Result;
use log::trace;
use region::Protection;
use std::ptr;

/// apply_bytes overwrites `patch.len()` bytes at `address` and returns the
/// bytes that were there before.
///
/// The write is bracketed by a scoped protection change: the pages covering the
/// region become read+write+execute for the duration of the copy and revert to
/// their previous protection when the guard drops, so code pages are never left
/// writable and always stay executable. The returned pre-image is the sole
/// source of truth for a later [`restore_bytes`].
///
/// # Safety
///
/// `address` must point to mapped memory valid for `patch.len()` bytes, and no
/// other code may be executing inside the patched region during the write.
pub unsafe fn apply_bytes(address: usize, patch: &[u8]) -> Result<Vec<u8>> {
    trace!("Patching {} bytes at {:#x}", patch.len(), address);
    let target = address as *mut u8;
    let _guard = region::protect_with_handle(target, patch.len(), Protection::READ_WRITE_EXECUTE)?;

    let mut original = vec![0u8; patch.len()];
    ptr::copy_nonoverlapping(target as *const u8, original.as_mut_ptr(), patch.len());
    ptr::copy_nonoverlapping(patch.as_ptr(), target, patch.len());
    Ok(original)
}

/// restore_bytes writes a pre-image captured by [`apply_bytes`] back to
/// `address`, under the same scoped protection change.
///
/// # Safety
///
/// Same contract as [`apply_bytes`]; additionally `original` must be the
/// pre-image captured for this exact address.
pub unsafe fn restore_bytes(address: usize, original: &[u8]) -> Result<()> {
    trace!("Restoring {} bytes at {:#x}", original.len(), address);
    let target = address as *mut u8;
    let _guard =
        region::protect_with_handle(target, original.len(), Protection::READ_WRITE_EXECUTE)?;

    ptr::copy_nonoverlapping(original.as_ptr(), target, original.len());
    Ok(())
}

/// Copies `len` bytes out of `address`.
///
/// # Safety
///
/// `address` must point to mapped, readable memory valid for `len` bytes.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(address as *const u8, len).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_returns_pre_image() {
        let mut buffer = vec![0x11u8, 0x22, 0x33, 0x44, 0x55];
        let address = buffer.as_mut_ptr() as usize;
        let original = unsafe { apply_bytes(address + 1, &[0xAA, 0xBB]) }.unwrap();
        assert_eq!(original, vec![0x22, 0x33]);
        assert_eq!(buffer, vec![0x11, 0xAA, 0xBB, 0x44, 0x55]);
    }

    #[test]
    fn test_restore_round_trip() {
        let mut buffer = vec![0xDEu8, 0xAD, 0xBE, 0xEF];
        let pristine = buffer.clone();
        let address = buffer.as_mut_ptr() as usize;
        let original = unsafe { apply_bytes(address, &[0x90, 0x90, 0x90, 0x90]) }.unwrap();
        assert_ne!(buffer, pristine);
        unsafe { restore_bytes(address, &original) }.unwrap();
        assert_eq!(buffer, pristine);
    }

    #[test]
    fn test_read_bytes() {
        let buffer = vec![1u8, 2, 3, 4];
        let address = buffer.as_ptr() as usize;
        assert_eq!(unsafe { read_bytes(address + 1, 2) }, vec![2, 3]);
    }
}
