use rand::Rng;

/// Generates the name for a new VM.
///
/// The name doubles as the session password material, so it must be
/// unguessable; it must also be a valid hostname label for every provider
/// we target, hence lowercase hex with a fixed prefix.
pub fn vm_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap()
        })
        .collect();
    format!("vb-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn vm_names_are_unique_and_hostname_safe() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let name = vm_name();
            assert!(name.starts_with("vb-"));
            assert_eq!(name.len(), 27);
            assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(name), "generated a duplicate name");
        }
    }
}
