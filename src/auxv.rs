use crate::error::SymbolResolutionError;

#[derive(Debug)]
pub struct AuxVecValues {
    pub(crate) vdso_base: usize,
    pub(crate) page_size: usize,
}

/// Reads the vDSO base and page size from the auxiliary vector the kernel
/// handed to this process.
pub(crate) fn read_aux_vec(symbol: &'static str) -> Result<AuxVecValues, SymbolResolutionError> {
    let vdso_base = unsafe { libc::getauxval(libc::AT_SYSINFO_EHDR) } as usize;
    let page_size = unsafe { libc::getauxval(libc::AT_PAGESZ) } as usize;
    if vdso_base == 0 || page_size == 0 {
        return Err(SymbolResolutionError {
            symbol,
            reason: "no vDSO in the auxiliary vector".to_string(),
        });
    }
    Ok(AuxVecValues {
        vdso_base,
        page_size,
    })
}
