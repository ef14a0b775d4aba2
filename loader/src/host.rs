use std::{
    ffi::{c_void, CString},
    mem, ptr,
};

use logger::{info, warn};
use rand::Rng;
use rewriter::{emit::REGION_JUMP_SLOT, ImportResolver, Result, RewriteError, Rewriter};
use windows::{
    core::PCSTR,
    Win32::{
        Foundation::HMODULE,
        System::{
            LibraryLoader::{GetProcAddress, LoadLibraryA},
            Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
            },
        },
    },
};

use crate::Args;

const DLL_PROCESS_ATTACH: u32 = 1;

struct WindowsHost;

impl ImportResolver for WindowsHost {
    fn load_module(&mut self, name: &str) -> Option<u64> {
        let name = CString::new(name).ok()?;
        let module = unsafe { LoadLibraryA(PCSTR(name.as_ptr() as *const u8)) }.ok()?;
        Some(module.0 as u64)
    }

    fn resolve_symbol(&mut self, module: u64, name: &str) -> Option<u64> {
        let name = CString::new(name).ok()?;
        let address = unsafe {
            GetProcAddress(
                HMODULE(module as *mut c_void),
                PCSTR(name.as_ptr() as *const u8),
            )
        }?;
        Some(address as usize as u64)
    }

    fn resolve_ordinal(&mut self, module: u64, ordinal: u16) -> Option<u64> {
        // GetProcAddress takes the ordinal in the low word of the name pointer
        let address = unsafe {
            GetProcAddress(
                HMODULE(module as *mut c_void),
                PCSTR(ordinal as usize as *const u8),
            )
        }?;
        Some(address as usize as u64)
    }
}

fn allocate(size: usize, executable: bool) -> Option<*mut u8> {
    let protect = if executable {
        PAGE_EXECUTE_READWRITE
    } else {
        PAGE_READWRITE
    };

    // a few tries at a randomized base so split regions end up scattered,
    // then let the system pick
    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let hint = (rng.gen_range(0x1_0000_0000u64..0x6FFF_0000_0000) & !0xFFFF) as *const c_void;
        let memory =
            unsafe { VirtualAlloc(Some(hint), size, MEM_COMMIT | MEM_RESERVE, protect) };
        if !memory.is_null() {
            return Some(memory as *mut u8);
        }
    }

    let memory = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, protect) };
    (!memory.is_null()).then(|| memory as *mut u8)
}

pub fn map(args: &Args) -> Result<()> {
    let mut session = Rewriter::open(&args.input)?;

    let split = args.split.max(1);
    let per_region = session.code_capacity_hint().div_ceil(split) + REGION_JUMP_SLOT;

    for index in 0..split {
        let base = allocate(per_region, true).ok_or(RewriteError::CapacityExhausted {
            region: index,
            needed: per_region,
        })?;
        info!("Code region {} at {:p} ({} bytes)", index, base, per_region);
        session.add_code_region(base, per_region);
    }

    let data_size = session.data_capacity_hint().max(1);
    let data = allocate(data_size, false).ok_or(RewriteError::CapacityExhausted {
        region: 0,
        needed: data_size,
    })?;
    info!("Data region at {:p} ({} bytes)", data, data_size);
    session.add_data_region(data, data_size);

    session.write(&mut WindowsHost)?;

    let Some(entry) = session.entry_point() else {
        warn!("Entry point is not covered by any emitted block");
        return Ok(());
    };
    info!("Entry point rewritten to {:#x}", entry);

    if args.run {
        invoke(&session, entry)?;
    }

    Ok(())
}

fn invoke(session: &Rewriter, entry: u64) -> Result<()> {
    if session.image().is_dll()? {
        type DllMain = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;
        let entry: DllMain = unsafe { mem::transmute(entry as usize) };
        let ok = unsafe { entry(ptr::null_mut(), DLL_PROCESS_ATTACH, ptr::null_mut()) };
        info!("DllMain returned {}", ok);
    } else {
        type EntryPoint = unsafe extern "system" fn() -> i32;
        let entry: EntryPoint = unsafe { mem::transmute(entry as usize) };
        let code = unsafe { entry() };
        info!("Entry point returned {}", code);
    }
    Ok(())
}
