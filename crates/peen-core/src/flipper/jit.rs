//! Runtime-emitted hammer code.
//!
//! The `machinecode` algorithm emits its unrolled hammer loop as raw opcode
//! bytes; the optional `dynasm` feature adds an assembler-library backend
//! used by the `blacksmith` algorithm. Either way the code lives in a
//! short-lived mapping that is writable first, executable afterwards, and
//! released when the [`HammerProgram`] is dropped.

use std::io;

use crate::memory::VirtAddr;
use crate::util::{mmap_anonymous, mprotect_exec, munmap};

#[cfg(feature = "dynasm")]
pub(crate) use self::blacksmith::assemble_blacksmith;

/// Length in bytes of the emitted cache-line flush.
#[cfg(target_feature = "clflushopt")]
pub(crate) const FLUSH_LEN: usize = 4;
/// Length in bytes of the emitted cache-line flush.
#[cfg(not(target_feature = "clflushopt"))]
pub(crate) const FLUSH_LEN: usize = 3;

/// Bytes of one per-aggressor group: address load, read, nops, flush.
pub(crate) const fn aggressor_group_len(nop_count: usize) -> usize {
    2 + 8 + 3 + nop_count + FLUSH_LEN
}

/// Emits the unrolled hammer loop as machine code.
///
/// The function body is
///
/// ```text
/// endbr64; push rbp; mov rbp, rsp
/// mov rbx, hammer_count
/// loop: ( movabs rax, agg; mov rcx, [rax]; nop*; clflush(opt) [rax] )*
///       mfence; dec rbx; jnz loop
/// pop rbp; ret
/// ```
///
/// with the backward jump offset computed from the unrolled body length.
pub fn emit_hammer_loop(aggs: &[VirtAddr], hammer_count: u32, nop_count: usize) -> Vec<u8> {
    // function prologue plus the hammer-count loop counter
    const FUNCTION_START: [u8; 11] = [
        0xf3, 0x0f, 0x1e, 0xfa, // endbr64
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x48, 0xc7, 0xc3, // mov rbx, <hammer_count>
    ];
    const MOV_AGG_ADDR: [u8; 2] = [0x48, 0xb8]; // movabs rax, <agg>
    const HAMMER_AGG: [u8; 3] = [0x48, 0x8b, 0x08]; // mov rcx, [rax]
    const NOP: u8 = 0x90;
    #[cfg(target_feature = "clflushopt")]
    const FLUSH_AGG: [u8; FLUSH_LEN] = [0x66, 0x0f, 0xae, 0x38]; // clflushopt [rax]
    #[cfg(not(target_feature = "clflushopt"))]
    const FLUSH_AGG: [u8; FLUSH_LEN] = [0x0f, 0xae, 0x38]; // clflush [rax]
    // mfence, decrement and close the loop
    const FUNC_END_START: [u8; 8] = [
        0x0f, 0xae, 0xf0, // mfence
        0x48, 0xff, 0xcb, // dec rbx
        0x0f, 0x85, // jnz rel32 -> start of loop
    ];
    const FUNC_END_END: [u8; 2] = [
        0x5d, // pop rbp
        0xc3, // ret
    ];

    let mut function = Vec::with_capacity(
        FUNCTION_START.len()
            + 4
            + aggs.len() * aggressor_group_len(nop_count)
            + FUNC_END_START.len()
            + 4
            + FUNC_END_END.len(),
    );
    function.extend_from_slice(&FUNCTION_START);
    function.extend_from_slice(&hammer_count.to_le_bytes());

    for &agg in aggs {
        function.extend_from_slice(&MOV_AGG_ADDR);
        function.extend_from_slice(&(agg as u64).to_le_bytes());
        function.extend_from_slice(&HAMMER_AGG);
        function.extend(std::iter::repeat_n(NOP, nop_count));
        function.extend_from_slice(&FLUSH_AGG);
    }

    // jump from the end of the jnz back over the unrolled body and the
    // loop tail itself
    let loop_len = aggs.len() * aggressor_group_len(nop_count) + FUNC_END_START.len() + 4;
    let jump_offset = -(loop_len as i32);

    function.extend_from_slice(&FUNC_END_START);
    function.extend_from_slice(&jump_offset.to_le_bytes());
    function.extend_from_slice(&FUNC_END_END);

    function
}

enum Backing {
    Mapped {
        ptr: *mut u8,
        len: usize,
    },
    #[cfg(feature = "dynasm")]
    Assembled {
        buf: dynasmrt::ExecutableBuffer,
        entry: dynasmrt::AssemblyOffset,
    },
}

/// An executable hammer function emitted at runtime.
///
/// Owns its executable mapping; dropping the program releases it.
pub struct HammerProgram {
    backing: Backing,
}

impl HammerProgram {
    /// Places raw machine code into a fresh mapping and flips it from
    /// writable to executable.
    ///
    /// # Errors
    ///
    /// Returns the mmap/mprotect errno on failure.
    pub fn from_bytes(code: &[u8]) -> io::Result<Self> {
        let ptr = mmap_anonymous(code.len(), 0)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if let Err(e) = mprotect_exec(ptr, code.len()) {
                munmap(ptr, code.len());
                return Err(e);
            }
        }
        Ok(HammerProgram {
            backing: Backing::Mapped {
                ptr,
                len: code.len(),
            },
        })
    }

    #[cfg(feature = "dynasm")]
    pub(crate) fn from_assembled(
        buf: dynasmrt::ExecutableBuffer,
        entry: dynasmrt::AssemblyOffset,
    ) -> Self {
        HammerProgram {
            backing: Backing::Assembled { buf, entry },
        }
    }

    /// Calls the emitted function.
    ///
    /// Returns whatever the code leaves in `eax`; the blacksmith program
    /// reports its tail-sync activation count there, the hand-emitted loop
    /// leaves it unspecified.
    pub fn run(&self) -> u32 {
        unsafe {
            let entry = match &self.backing {
                Backing::Mapped { ptr, .. } => *ptr as *const u8,
                #[cfg(feature = "dynasm")]
                Backing::Assembled { buf, entry } => buf.ptr(*entry),
            };
            let f: extern "C" fn() -> u32 = std::mem::transmute(entry);
            f()
        }
    }
}

impl Drop for HammerProgram {
    fn drop(&mut self) {
        if let Backing::Mapped { ptr, len } = self.backing {
            unsafe { munmap(ptr, len) };
        }
    }
}

#[cfg(feature = "dynasm")]
mod blacksmith {
    use dynasmrt::x64::Assembler;
    use dynasmrt::{DynasmApi, DynasmLabelApi, dynasm};
    use std::collections::HashMap;
    use std::io;

    use super::HammerProgram;
    use crate::config::{BlacksmithConfig, Fencing, Flushing, SyncFencing};
    use crate::memory::VirtAddr;

    fn flush_rax(ops: &mut Assembler) {
        #[cfg(target_feature = "clflushopt")]
        dynasm!(ops
            ; clflushopt [rax]
        );
        #[cfg(not(target_feature = "clflushopt"))]
        dynasm!(ops
            ; clflush [rax]
            ; lfence
        );
    }

    /// Emits the refresh-synchronisation loop: flush and re-access the
    /// given aggressors until two timestamps straddle a refresh hiccup
    /// (more than 1000 cycles apart). `count_activations` additionally
    /// counts each access into `edx`.
    fn sync_ref(
        ops: &mut Assembler,
        aggs: &[VirtAddr],
        sync_fencing: SyncFencing,
        count_activations: bool,
    ) {
        let begin = ops.new_dynamic_label();
        let end = ops.new_dynamic_label();

        dynasm!(ops
            ; =>begin
        );
        if sync_fencing == SyncFencing::BeforeRdtscp {
            dynasm!(ops
                ; mfence
                ; lfence
            );
        }
        // rdtscp clobbers edx; preserve the activation counter
        dynasm!(ops
            ; push rdx
            ; rdtscp
        );
        if sync_fencing == SyncFencing::AfterRdtscp {
            dynasm!(ops
                ; lfence
            );
        }
        dynasm!(ops
            ; mov ebx, eax
        );
        if sync_fencing == SyncFencing::BeforeRdtscp {
            dynasm!(ops
                ; lfence
            );
        }
        dynasm!(ops
            ; pop rdx
        );

        for &agg in aggs {
            dynasm!(ops
                ; mov rax, QWORD agg as i64
            );
            flush_rax(ops);
            dynasm!(ops
                ; mov rax, QWORD agg as i64
                ; mov rcx, [rax]
            );
            if count_activations {
                dynasm!(ops
                    ; inc edx
                );
            }
        }

        dynasm!(ops
            ; push rdx
        );
        if sync_fencing == SyncFencing::BeforeRdtscp {
            dynasm!(ops
                ; mfence
                ; lfence
            );
        }
        dynasm!(ops
            ; rdtscp
            ; lfence
            ; pop rdx
            ; sub eax, ebx
            ; cmp eax, 1000
            ; jg =>end
            ; jmp =>begin
            ; =>end
        );
    }

    /// Assembles the blacksmith hammer function for aggressors already in
    /// hammering order: head sync over the first `num_aggs_for_sync`
    /// aggressors, the fenced/flushed main loop over the middle ones, and
    /// a tail sync that counts its activations into the return value.
    pub(crate) fn assemble_blacksmith(
        ordered_aggs: &[VirtAddr],
        config: &BlacksmithConfig,
    ) -> io::Result<HammerProgram> {
        let n_sync = config.num_aggs_for_sync;
        assert!(
            ordered_aggs.len() >= 2 * n_sync,
            "not enough aggressors for head and tail sync"
        );

        let mut ops = Assembler::new()?;
        let entry = ops.offset();

        // part 1: synchronize with the beginning of a refresh interval
        for &agg in &ordered_aggs[..n_sync] {
            dynasm!(ops
                ; mov rax, QWORD agg as i64
                ; mov rbx, [rax]
            );
        }

        let while1_begin = ops.new_dynamic_label();
        let while1_end = ops.new_dynamic_label();
        dynasm!(ops
            ; =>while1_begin
        );
        for &agg in &ordered_aggs[..n_sync] {
            dynasm!(ops
                ; mov rax, QWORD agg as i64
            );
            flush_rax(&mut ops);
        }
        dynasm!(ops
            ; mfence
            ; rdtscp
            ; lfence
            ; mov ebx, eax
        );
        for &agg in &ordered_aggs[..n_sync] {
            dynasm!(ops
                ; mov rax, QWORD agg as i64
                ; mov rcx, [rax]
            );
        }
        if config.sync_fencing == SyncFencing::BeforeRdtscp {
            dynasm!(ops
                ; mfence
                ; lfence
            );
        }
        dynasm!(ops
            ; rdtscp
        );
        if config.sync_fencing == SyncFencing::AfterRdtscp {
            dynasm!(ops
                ; lfence
            );
        }
        dynasm!(ops
            ; sub eax, ebx
            ; cmp eax, 1000
            ; jg =>while1_end
            ; jmp =>while1_begin
            ; =>while1_end
        );

        // part 2: perform hammering
        let for_begin = ops.new_dynamic_label();
        let for_end = ops.new_dynamic_label();
        dynasm!(ops
            ; mov rsi, QWORD config.total_num_activations as i64
            ; mov edx, 0
            ; =>for_begin
            ; cmp rsi, 0
            ; jle =>for_end
        );

        let mut accessed_before: HashMap<VirtAddr, bool> = HashMap::new();
        for &agg in &ordered_aggs[n_sync..ordered_aggs.len() - n_sync] {
            if *accessed_before.get(&agg).unwrap_or(&false) {
                if config.flushing == Flushing::LatestPossible {
                    dynasm!(ops
                        ; mov rax, QWORD agg as i64
                    );
                    flush_rax(&mut ops);
                    accessed_before.insert(agg, false);
                }
                // ordering fence so aggressors always hit in the same order
                if config.fencing == Fencing::LatestPossible {
                    dynasm!(ops
                        ; mfence
                    );
                    accessed_before.insert(agg, false);
                }
            }

            dynasm!(ops
                ; mov rax, QWORD agg as i64
                ; mov rcx, [rax]
                ; dec rsi
            );
            accessed_before.insert(agg, true);

            if config.flushing == Flushing::EarliestPossible {
                dynasm!(ops
                    ; mov rax, QWORD agg as i64
                );
                flush_rax(&mut ops);
            }
        }
        dynasm!(ops
            ; mfence
        );

        // part 3: synchronize with the end of the interval, counting its
        // activations into edx
        sync_ref(
            &mut ops,
            &ordered_aggs[ordered_aggs.len() - n_sync..],
            config.sync_fencing,
            true,
        );

        dynasm!(ops
            ; jmp =>for_begin
            ; =>for_end
            ; mov eax, edx
            ; ret
        );

        let buf = ops
            .finalize()
            .map_err(|_| io::Error::other("assembler finalize failed"))?;
        Ok(HammerProgram::from_assembled(buf, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_layout() {
        let aggs = [0x1000usize, 0x2000];
        let nop_count = 4;
        let code = emit_hammer_loop(&aggs, 5, nop_count);

        let group = aggressor_group_len(nop_count);
        assert_eq!(code.len(), 11 + 4 + 2 * group + 8 + 4 + 2);

        // endbr64 prologue
        assert_eq!(&code[..4], &[0xf3, 0x0f, 0x1e, 0xfa]);
        // hammer count behind mov rbx
        assert_eq!(&code[11..15], &5u32.to_le_bytes());
        // first aggressor address behind movabs rax
        assert_eq!(&code[17..25], &0x1000u64.to_le_bytes());
        // backward jump over both groups and the loop tail
        let rel = i32::from_le_bytes(code[code.len() - 6..code.len() - 2].try_into().unwrap());
        assert_eq!(rel, -((2 * group + 12) as i32));
        // pop rbp; ret
        assert_eq!(&code[code.len() - 2..], &[0x5d, 0xc3]);
    }

    #[test]
    fn test_emitted_function_runs() {
        let target = Box::new([0u8; 64]);
        let addr = target.as_ptr() as VirtAddr;
        let code = emit_hammer_loop(&[addr], 16, 2);
        let program = HammerProgram::from_bytes(&code).unwrap();
        program.run();
        // reached only if the emitted loop terminated and returned
        drop(program);
        drop(target);
    }
}
