//! Binds to an NVMe device, brings it up and prints what it found.
//!
//! Usage: identify <pci address>, e.g. identify 0000:03:00.0
//! The device must be unbound from its kernel driver and /mnt/huge must be
//! mounted with free huge pages.

use std::env;
use std::process;

fn main() {
    env_logger::init();

    let Some(pci_address) = env::args().nth(1) else {
        eprintln!("usage: identify <pci address>");
        process::exit(1);
    };

    let mut controller = match nvme_host::new_from_pci(&pci_address) {
        Ok(controller) => controller,
        Err(error) => {
            eprintln!("failed to bind {pci_address}: {error}");
            process::exit(1);
        }
    };

    if let Err(error) = controller.init() {
        eprintln!("failed to initialize {pci_address}: {error}");
        process::exit(1);
    }

    let information = controller.information().expect("init filled this in");
    println!("serial number:     {}", information.serial_number);
    println!("model number:      {}", information.model_number);
    println!("firmware revision: {}", information.firmware_revision);
    println!("NVMe version:      {}", information.version);
    println!("max transfer size: {} bytes", information.maximum_data_transfer_size);

    for id in controller.namespace_ids() {
        let namespace = controller.namespace(id).expect("id came from the map");
        let (info, _) = namespace.query();
        println!(
            "{}: {} blocks of {} bytes",
            namespace.name(),
            info.block_count,
            info.block_size
        );
    }

    if let Err(error) = controller.shutdown() {
        eprintln!("shutdown failed: {error}");
        process::exit(1);
    }
}
