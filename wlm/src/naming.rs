use rand::{distributions::Alphanumeric, Rng};

/// length of the random part appended to a base name
pub const SUFFIX_LENGTH: usize = 6;

/// human readable job name, `<base>_` followed by random alphanumerics
pub fn random_name(base: &str) -> String {
    random_name_with(base, &mut rand::thread_rng())
}

pub fn random_name_with<R: Rng>(base: &str, rng: &mut R) -> String {
    let suffix: String = (0..SUFFIX_LENGTH)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect();

    format!("{base}_{suffix}")
}
