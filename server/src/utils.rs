use std::fmt::Write;

/// Number of random bytes behind a machine id.
pub const MACHINE_ID_BYTES: usize = 20;

/// Generates a random machine id rendered as lowercase hex
pub fn machine_id() -> String {
    let bytes: [u8; MACHINE_ID_BYTES] = rand::random();
    bytes.iter().fold(
        String::with_capacity(MACHINE_ID_BYTES * 2),
        |mut id, byte| {
            let _ = write!(id, "{:02x}", byte);
            id
        },
    )
}
