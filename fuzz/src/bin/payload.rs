#[cfg(not(windows))]
mod fuzz {
    use std::{io::Cursor, sync::atomic::AtomicBool};

    use honggfuzz::fuzz;
    use rmupdate::{format::payload::PayloadReader, stream::MutexFile};

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);
        // Writes fail once this is full, which bounds the work done for
        // extents with huge block counts.
        let mut output = vec![0u8; 16 * 1024 * 1024];

        loop {
            fuzz!(|data: &[u8]| {
                let reader = MutexFile::new(Cursor::new(data));
                if let Ok(payload_reader) = PayloadReader::new(reader, &cancel_signal) {
                    let manifest = payload_reader.manifest();

                    if let Ok(install_info) = payload_reader.install_info() {
                        let _ = payload_reader.execute(
                            &manifest.partition_operations,
                            install_info,
                            Cursor::new(output.as_mut_slice()),
                            &cancel_signal,
                        );
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
