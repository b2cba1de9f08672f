use std::collections::HashSet;

use rand::{Rng, distributions::Alphanumeric};

/// Generate a short id guarded against collision with `existing`. Used to
/// fill in a chain step's id when the caller left it blank.
pub fn generate_id(existing: &HashSet<String>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: String =
            (&mut rng).sample_iter(&Alphanumeric).take(8).map(char::from).collect::<String>().to_lowercase();
        if !existing.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avoids_existing_ids() {
        let mut existing = HashSet::new();
        for _ in 0..50 {
            let id = generate_id(&existing);
            assert!(!existing.contains(&id));
            existing.insert(id);
        }
    }
}
