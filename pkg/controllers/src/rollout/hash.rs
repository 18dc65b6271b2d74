use pkg_types::pod::PodTemplateSpec;
use pkg_types::rollout::Rollout;
use serde::Serialize;
use std::io;

/// Characters used for hashes that end up in object names: no vowels (so
/// no accidental words) and no characters that are easy to confuse.
const ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a, fed through `io::Write` so values can be serialized
/// straight into it.
struct Fnv32a(u32);

impl Fnv32a {
    fn new() -> Self {
        Fnv32a(FNV_OFFSET)
    }
}

impl io::Write for Fnv32a {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for b in buf {
            self.0 ^= u32::from(*b);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Map every character of `s` onto [`ALPHANUMS`].
pub fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| ALPHANUMS[usize::from(b) % ALPHANUMS.len()] as char)
        .collect()
}

fn hash_with<T: Serialize>(value: &T, salt: Option<i32>) -> Result<String, serde_json::Error> {
    let mut hasher = Fnv32a::new();
    serde_json::to_writer(&mut hasher, value)?;
    if let Some(salt) = salt {
        io::Write::write_all(&mut hasher, &(salt as u32).to_le_bytes()).map_err(serde_json::Error::io)?;
    }
    Ok(safe_encode(&hasher.0.to_string()))
}

/// Pod-template hash. A collision count, once set, is mixed in so a bumped
/// count yields a different name for the next ReplicaSet.
pub fn template_hash(
    template: &PodTemplateSpec,
    collision_count: Option<i32>,
) -> Result<String, serde_json::Error> {
    hash_with(template, collision_count)
}

/// Hash of the Rollout spec, stored as `status.observedGeneration`.
pub fn generation_hash(rollout: &Rollout) -> Result<String, serde_json::Error> {
    hash_with(&rollout.spec, None)
}

/// Hash of the canary step list; empty for blue-green.
pub fn step_hash(rollout: &Rollout) -> Result<String, serde_json::Error> {
    match rollout.canary() {
        Some(canary) => hash_with(&canary.steps, None),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::{ContainerSpec, PodSpec};

    fn template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: PodSpec {
                containers: vec![ContainerSpec {
                    name: "web".to_string(),
                    image: image.to_string(),
                    command: vec![],
                    args: vec![],
                    env: Default::default(),
                    resources: Default::default(),
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn fnv_matches_reference_vectors() {
        let mut h = Fnv32a::new();
        io::Write::write(&mut h, b"").unwrap();
        assert_eq!(h.0, 0x811c_9dc5);
        let mut h = Fnv32a::new();
        io::Write::write(&mut h, b"a").unwrap();
        assert_eq!(h.0, 0xe40c_292c);
    }

    #[test]
    fn hash_is_stable_and_name_safe() {
        let a = template_hash(&template("nginx:1.25"), None).unwrap();
        let b = template_hash(&template("nginx:1.25"), None).unwrap();
        assert_eq!(a, b);
        assert!(a.bytes().all(|c| ALPHANUMS.contains(&c)));
        assert_ne!(a, template_hash(&template("nginx:1.26"), None).unwrap());
    }

    #[test]
    fn collision_count_changes_hash() {
        let t = template("nginx:1.25");
        let base = template_hash(&t, None).unwrap();
        let one = template_hash(&t, Some(1)).unwrap();
        let two = template_hash(&t, Some(2)).unwrap();
        assert_ne!(base, one);
        assert_ne!(one, two);
    }
}
