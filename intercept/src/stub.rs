//! Redirect stubs written over a hooked entry point, and decoding of the
//! indirect jumps that PLT entries and our own stubs are made of.

use core::sync::atomic::AtomicUsize;

use crate::types::HookError;

/// Bytes overwritten at the hooked entry point.
#[cfg(target_arch = "x86_64")]
pub const STUB_LEN: usize = 16;
#[cfg(target_arch = "x86")]
pub const STUB_LEN: usize = 6;
#[cfg(target_arch = "aarch64")]
pub const STUB_LEN: usize = 16;
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
pub const STUB_LEN: usize = 16;

/// Encode an absolute jump to `target`.
///
/// i386 has no RIP-relative addressing, so its stub jumps through `cell`,
/// which receives `target` and must outlive the stub. Other targets embed
/// the address and ignore `cell`.
pub fn encode_redirect(target: usize, cell: &'static AtomicUsize) -> Result<[u8; STUB_LEN], HookError> {
    #[allow(unused_mut)]
    let mut code = [0u8; STUB_LEN];

    #[cfg(target_arch = "x86_64")]
    {
        let _ = cell;
        // FF /4 = JMP r/m64; ModRM mod=00 rm=5 (RIP+disp32), disp32 = 2 to
        // skip the UD2 that traps a fall-through.
        code[..6].copy_from_slice(&[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00]);
        code[6..8].copy_from_slice(&[0x0F, 0x0B]);
        code[8..].copy_from_slice(&(target as u64).to_le_bytes());
        Ok(code)
    }

    #[cfg(target_arch = "x86")]
    {
        // FF /4 = JMP r/m32; ModRM mod=00 rm=5 (absolute disp32).
        cell.store(target, core::sync::atomic::Ordering::Release);
        code[..2].copy_from_slice(&[0xFF, 0x25]);
        code[2..].copy_from_slice(&(cell.as_ptr() as u32).to_le_bytes());
        Ok(code)
    }

    #[cfg(target_arch = "aarch64")]
    {
        let _ = cell;
        // LDR X16, #8; BR X16; .quad target
        code[..4].copy_from_slice(&0x5800_0050u32.to_le_bytes());
        code[4..8].copy_from_slice(&0xD61F_0200u32.to_le_bytes());
        code[8..].copy_from_slice(&(target as u64).to_le_bytes());
        Ok(code)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    {
        let _ = (target, cell);
        Err(HookError::Unsupported)
    }
}

/// If `addr` starts with an absolute indirect jump (`jmp [mem]`), the
/// address that jump lands on.
///
/// # Safety
/// `addr` must be readable for [`STUB_LEN`] bytes, and any jump slot it
/// references must be readable.
pub unsafe fn decode_indirect_jump(addr: usize) -> Option<usize> {
    #[cfg(target_arch = "x86_64")]
    {
        let mut p = addr as *const u8;
        // endbr64
        if core::slice::from_raw_parts(p, 4) == [0xF3, 0x0F, 0x1E, 0xFA] {
            p = p.add(4);
        }
        // bnd prefix
        if *p == 0xF2 {
            p = p.add(1);
        }
        if *p != 0xFF || *p.add(1) != 0x25 {
            return None;
        }
        let disp = core::ptr::read_unaligned(p.add(2) as *const i32);
        let slot = (p as usize + 6).wrapping_add_signed(disp as isize);
        Some(core::ptr::read_unaligned(slot as *const u64) as usize)
    }

    #[cfg(target_arch = "x86")]
    {
        let p = addr as *const u8;
        if *p != 0xFF || *p.add(1) != 0x25 {
            return None;
        }
        let slot = core::ptr::read_unaligned(p.add(2) as *const u32) as usize;
        Some(core::ptr::read_unaligned(slot as *const u32) as usize)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    {
        let _ = addr;
        None
    }
}

/// Follow chained indirect jumps (PLT entries) to the real entry point.
///
/// # Safety
/// See [`decode_indirect_jump`]; applies to every hop.
pub unsafe fn follow_indirect_jumps(mut addr: usize) -> usize {
    const MAX_HOPS: usize = 4;
    for _ in 0..MAX_HOPS {
        match decode_indirect_jump(addr) {
            Some(next) if next != 0 && next != addr => addr = next,
            _ => break,
        }
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    static CELL: AtomicUsize = AtomicUsize::new(0);

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
    fn redirect_stub_embeds_target() {
        let target = 0x1234_5678usize;
        let code = encode_redirect(target, &CELL).expect("encode");

        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(&code[..8], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
            assert_eq!(u64::from_le_bytes(code[8..].try_into().unwrap()), target as u64);
        }
        #[cfg(target_arch = "x86")]
        {
            assert_eq!(&code[..2], &[0xFF, 0x25]);
            assert_eq!(CELL.load(core::sync::atomic::Ordering::Acquire), target);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(u32::from_le_bytes(code[..4].try_into().unwrap()), 0x5800_0050);
            assert_eq!(u32::from_le_bytes(code[4..8].try_into().unwrap()), 0xD61F_0200);
            assert_eq!(u64::from_le_bytes(code[8..].try_into().unwrap()), target as u64);
        }
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    fn own_stub_decodes_back_to_its_target() {
        let target = 0x0BAD_F00Dusize;
        let code = encode_redirect(target, &CELL).expect("encode");
        let decoded = unsafe { decode_indirect_jump(code.as_ptr() as usize) };
        assert_eq!(decoded, Some(target));
    }

    #[test]
    fn non_jump_code_is_left_alone() {
        // ret, padded.
        let code = [0xC3u8; STUB_LEN];
        let addr = code.as_ptr() as usize;
        assert_eq!(unsafe { decode_indirect_jump(addr) }, None);
        assert_eq!(unsafe { follow_indirect_jumps(addr) }, addr);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn endbr_and_bnd_prefixed_plt_entries_decode() {
        let slot: u64 = 0xFEED_0000;
        let mut code = [0xCCu8; 16];
        code[..4].copy_from_slice(&[0xF3, 0x0F, 0x1E, 0xFA]);
        code[4..7].copy_from_slice(&[0xF2, 0xFF, 0x25]);
        let end_of_jmp = code.as_ptr() as usize + 11;
        let disp = (&slot as *const u64 as usize).wrapping_sub(end_of_jmp) as i64 as i32;
        code[7..11].copy_from_slice(&disp.to_le_bytes());
        assert_eq!(unsafe { decode_indirect_jump(code.as_ptr() as usize) }, Some(0xFEED_0000));
    }
}
