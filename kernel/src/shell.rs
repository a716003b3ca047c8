//! The interactive demo shell (§8 scenario 4, §11.2): a one-word command
//! line read from the keyboard ring, echoed to both live outputs, with a
//! single `load <path>` command that finds a boot module, loads it as an
//! ELF image, and jumps to its entry point with the kernel table in RDI.

use alloc::string::String;

use crate::boot::BootInfo;
use crate::{elf, err, kernel_table, keyboard, println};

const LINE_CAPACITY: usize = 128;

/// Polls the keyboard ring for the next line (terminated by `\n`), blocking
/// the caller by spinning, since there is no scheduler to yield to.
fn read_line() -> String {
    let mut line = String::with_capacity(LINE_CAPACITY);
    loop {
        match keyboard::KEYBOARD.lock().pop() {
            Some(b'\n') => {
                println!();
                return line;
            }
            Some(byte) if line.len() < LINE_CAPACITY => {
                crate::print!("{}", byte as char);
                line.push(byte as char);
            }
            Some(_) => (), // line full, drop further input until newline
            None => core::hint::spin_loop(),
        }
    }
}

/// Loads the named boot module as an ELF image and transfers control to its
/// entry point, passing `&kernel_table::KERNEL_TABLE` per the SysV calling
/// convention. Never returns on success; the loaded program owns the CPU.
fn load_and_jump(boot: &BootInfo, path: &str) {
    let module = match boot.find_module(path) {
        Some(module) => module,
        None => {
            println!("no such module: {}", path);
            return;
        }
    };

    let data: &'static [u8] = unsafe { core::slice::from_raw_parts(module.address, module.size) };
    match elf::load(data) {
        Ok(entry) => {
            println!("Jumping to entry point...");
            let entry: extern "C" fn(*const kernel_table::KernelTable) -> ! =
                unsafe { core::mem::transmute(entry as usize) };
            entry(&kernel_table::KERNEL_TABLE);
        }
        Err(reason) => err!("failed to load {}: {}", path, reason),
    }
}

/// Runs forever. Known commands: `load <path>`; anything else is reported
/// and the prompt reprinted (§8 scenario 4).
pub fn run(boot: &BootInfo) -> ! {
    loop {
        crate::print!("> ");
        let line = read_line();
        let line = line.trim();

        if let Some(path) = line.strip_prefix("load ") {
            load_and_jump(boot, path.trim());
        } else if line.is_empty() {
            // ignore a bare newline
        } else {
            println!("unknown command: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_load_prefix() {
        let line = "load test.elf";
        assert_eq!(line.strip_prefix("load "), Some("test.elf"));
    }

    #[test]
    fn non_load_lines_are_not_matched() {
        let line = "help";
        assert_eq!(line.strip_prefix("load "), None);
    }
}
