//! Last-resort lookup of the kernel's own clock entry points, used when the
//! dynamic linker cannot hand us the libc ones.

use crate::auxv;
use crate::error::SymbolResolutionError;
use goblin::elf::*;
use goblin::strtab::Strtab;
use std::fs::{self, File};
use std::os::unix::prelude::FileExt;

#[derive(Debug)]
pub(crate) struct Range {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

pub(crate) struct DynSym {
    pub(crate) name: String,
    pub(crate) address: u64,
}

#[allow(non_camel_case_types)]
pub(crate) struct vDSO {}

fn fail(symbol: &'static str, reason: impl ToString) -> SymbolResolutionError {
    SymbolResolutionError {
        symbol,
        reason: reason.to_string(),
    }
}

impl vDSO {
    pub(crate) fn read(range: &Range, symbol: &'static str) -> Result<Vec<u8>, SymbolResolutionError> {
        let mut buf = vec![0; range.end - range.start];
        let f = File::open("/proc/self/mem").map_err(|e| fail(symbol, e))?;
        f.read_exact_at(&mut buf, range.start as u64)
            .map_err(|e| fail(symbol, e))?;
        Ok(buf)
    }

    pub(crate) fn find(symbol: &'static str) -> Result<Range, SymbolResolutionError> {
        let data = fs::read_to_string("/proc/self/maps").map_err(|e| fail(symbol, e))?;

        for line in data.lines() {
            if !line.ends_with("[vdso]") {
                continue;
            }
            let range = line.split_whitespace().next().unwrap_or_default();
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| fail(symbol, format!("bad maps line {:?}", line)))?;
            let parse = |s: &str| usize::from_str_radix(s, 16).map_err(|e| fail(symbol, e));
            return Ok(Range {
                start: parse(start)?,
                end: parse(end)?,
            });
        }
        Err(fail(symbol, "no vDSO mapped in memory range"))
    }

    /// Dynamic symbols of the image, with addresses relative to its first
    /// loadable segment.
    pub(crate) fn dynsyms(buf: &[u8], symbol: &'static str) -> Result<Vec<DynSym>, SymbolResolutionError> {
        let r = Elf::parse(buf).map_err(|e| fail(symbol, e))?;

        let load_vaddr = r
            .program_headers
            .iter()
            .find(|s| s.p_type == program_header::PT_LOAD)
            .map(|s| s.p_vaddr)
            .ok_or_else(|| fail(symbol, "vDSO has no loadable segment"))?;

        let mut ret = vec![];
        for ds in &r.dynsyms {
            if ds.st_value == 0 {
                continue;
            }
            let Some(address) = relative_address(ds.st_value, load_vaddr) else {
                continue;
            };
            ret.push(DynSym {
                name: get_str_til_nul(&r.dynstrtab, ds.st_name),
                address,
            });
        }
        Ok(ret)
    }

    /// Address of `vdso_name` in this process, e.g. `__vdso_gettimeofday`.
    pub(crate) fn lookup(
        symbol: &'static str,
        vdso_name: &str,
    ) -> Result<usize, SymbolResolutionError> {
        let aux = auxv::read_aux_vec(symbol)?;
        let range = vDSO::find(symbol)?;
        if range.start != aux.vdso_base || range.start % aux.page_size != 0 {
            return Err(fail(
                symbol,
                format!(
                    "vDSO mapped at {:#x} but auxv says {:#x}",
                    range.start, aux.vdso_base
                ),
            ));
        }
        let image = vDSO::read(&range, symbol)?;
        vDSO::dynsyms(&image, symbol)?
            .into_iter()
            .find(|s| s.name == vdso_name)
            .map(|s| range.start + s.address as usize)
            .ok_or_else(|| fail(symbol, format!("{} not exported by the vDSO", vdso_name)))
    }
}

/// Offset of a symbol from the first loadable segment; `None` for symbols
/// below it, which cannot be addressed.
fn relative_address(st_value: u64, load_vaddr: u64) -> Option<u64> {
    st_value.checked_sub(load_vaddr)
}

fn get_str_til_nul(s: &Strtab, at: usize) -> String {
    let mut ret: String = "".to_string();
    for c in s.get_at(at).unwrap_or_default().bytes() {
        if c == 0 {
            break;
        }
        ret.push(c.into());
    }
    ret
}
