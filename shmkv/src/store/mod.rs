use shared_memory::Shmem;

use crate::core::{
    map_segment, OverflowPolicy, PodView, SegmentLayout, StoreConfig, KEY_LEN, NUM_PODS,
    POD_DEPTH, VALUE_LEN,
};
use crate::errors::StoreError;
use crate::index::PodIndex;
use crate::sync::PodLock;

/// Routes a key to its pod: a rolling hash seeded with 7, multiplied by
/// 31 and reduced modulo the pod count at every step. The constants are
/// fixed for good; they decide placement for the whole lifetime of any
/// segment.
pub(crate) fn pod_for_key(key: &[u8]) -> usize {
    let mut h: usize = 7;
    for &byte in key {
        h = (h * 31 + byte as usize) % NUM_PODS;
    }
    h
}

/// A key normalized for storage: clamped to `KEY_LEN` and zero-padded.
/// Hashing uses the logical bytes so routing and slot comparison can
/// never disagree about a key's identity.
struct PodKey {
    buf: [u8; KEY_LEN],
    len: usize,
}

impl PodKey {
    fn slot_bytes(&self) -> &[u8; KEY_LEN] {
        &self.buf
    }

    fn logical(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

fn normalize_key(key: &[u8], policy: OverflowPolicy) -> Result<PodKey, StoreError> {
    if key.is_empty() {
        // An all-zero key buffer marks a free slot, so the empty key
        // cannot name data.
        return Err(StoreError::EmptyKey);
    }
    if key.len() > KEY_LEN && policy == OverflowPolicy::Reject {
        return Err(StoreError::KeyTooLong(key.len()));
    }
    let len = key.len().min(KEY_LEN);
    let mut buf = [0u8; KEY_LEN];
    buf[..len].copy_from_slice(&key[..len]);
    Ok(PodKey { buf, len })
}

fn clamp_value(value: &[u8], policy: OverflowPolicy) -> Result<&[u8], StoreError> {
    if value.len() <= VALUE_LEN {
        return Ok(value);
    }
    match policy {
        OverflowPolicy::Truncate => Ok(&value[..VALUE_LEN]),
        OverflowPolicy::Reject => Err(StoreError::ValueTooLong(value.len())),
    }
}

/// Values are zero-padded in their slot; the stored value ends at the
/// first zero byte, or fills the whole buffer.
fn extract_value(raw: &[u8]) -> Vec<u8> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    raw[..len].to_vec()
}

struct Pod {
    view: PodView,
    lock: PodLock,
}

/// One process's handle on a named store. Each attaching process opens
/// its own handle; handles are not meant to cross threads, the same way
/// the segment is not meant to be attached twice by one process.
pub struct Store {
    cfg: StoreConfig,
    shmem: Shmem,
    pods: Vec<Pod>,
    index: Vec<PodIndex>,
}

impl Store {
    /// Creates the named store, or attaches to it when a segment of
    /// that name already exists. Only the creating process zeroes the
    /// pods and initializes the gates; attaching never touches live
    /// state. An attacher racing the creator through initialization can
    /// observe half-built gates; serializing first contact is the
    /// caller's responsibility, as is making sure at most one attached
    /// process ever calls [`Store::delete`].
    pub fn create(cfg: &StoreConfig) -> Result<Store, StoreError> {
        let layout = SegmentLayout::new();
        let (mut shmem, created) = map_segment(cfg, &layout)?;
        let base = shmem.as_ptr();

        let mut pods = Vec::with_capacity(NUM_PODS);
        let mut index = Vec::with_capacity(NUM_PODS);
        for pod in 0..NUM_PODS {
            let view = unsafe { PodView::new(base, layout, pod) };
            if created {
                // On failure the mapping is still owned, so dropping it
                // below unlinks the half-initialized segment.
                view.initialize()?;
            }
            let lock = unsafe {
                PodLock::attach(
                    view.read_gate_ptr(),
                    view.write_gate_ptr(),
                    view.num_readers_ptr(),
                )
            };
            pods.push(Pod { view, lock });
            index.push(PodIndex::new());
        }

        if created {
            // A dropped handle must never unlink the segment other
            // processes are attached to; only `delete` re-takes
            // ownership of the backing object.
            shmem.set_owner(false);
        }

        Ok(Store {
            cfg: cfg.clone(),
            shmem,
            pods,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Writes a key-value pair. Always succeeds for capacity: the slot
    /// under the pod's write cursor is overwritten and the cursor
    /// advances, so a full pod silently evicts its oldest write. When
    /// the evicted slot held the last occurrence of its key, that key's
    /// index entry is dropped.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let key = normalize_key(key, self.cfg.overflow)?;
        let value = clamp_value(value, self.cfg.overflow)?;
        let pod_no = pod_for_key(key.logical());
        let pod = &self.pods[pod_no];
        let ipod = &mut self.index[pod_no];

        pod.lock.with_write(|| {
            let victim = pod.view.write_cursor();
            pod.view.set_write_cursor((victim + 1) % POD_DEPTH);

            let mut evicted = [0u8; KEY_LEN];
            evicted.copy_from_slice(pod.view.key_at(victim));
            pod.view.store_slot(victim, key.slot_bytes(), value);

            if evicted[0] != 0 && !pod_holds(&pod.view, &evicted) {
                ipod.remove(&evicted);
            }
            ipod.add(key.slot_bytes(), victim)
        })?
    }

    /// Reads one value for `key`, `None` when the key is not in its
    /// pod. Repeated reads of a key with several live occurrences walk
    /// them round-robin in slot order. The cursor driving that walk is
    /// local to this handle: two attached processes each cycle through
    /// duplicates in their own order.
    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let key = normalize_key(key, self.cfg.overflow)?;
        let pod_no = pod_for_key(key.logical());
        let pod = &self.pods[pod_no];
        let ipod = &mut self.index[pod_no];

        let hit = pod
            .lock
            .with_read(|| read_and_advance(&pod.view, ipod, &key))??;
        Ok(hit.map(|(_, value)| value))
    }

    /// Reads every live occurrence of `key` in one locked pass,
    /// starting at this handle's cursor and cycling once around the
    /// pod. Duplicate writes come back in insertion order when the pod
    /// has not wrapped past any of them. Empty when the key is absent.
    pub fn read_all(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let key = normalize_key(key, self.cfg.overflow)?;
        let pod_no = pod_for_key(key.logical());
        let pod = &self.pods[pod_no];
        let ipod = &mut self.index[pod_no];

        pod.lock.with_read(|| {
            let mut values = Vec::new();
            let first = match read_and_advance(&pod.view, ipod, &key)? {
                Some((slot, value)) => {
                    values.push(value);
                    slot
                }
                None => return Ok(values),
            };
            // The occurrence set cannot change under the held read
            // lock, so the cursor comes back to the first hit after one
            // full cycle through the duplicates.
            while ipod.get(key.slot_bytes()) != Some(first) {
                match read_and_advance(&pod.view, ipod, &key)? {
                    Some((_, value)) => values.push(value),
                    None => break,
                }
            }
            Ok(values)
        })?
    }

    /// Tears the store down: destroys the pod gates, unmaps the
    /// segment, and removes the named backing object so a later
    /// `create` of the same name starts fresh. Other processes still
    /// attached are left with dangling gates; at most one attached
    /// process may delete, and that is the caller's contract.
    pub fn delete(mut self) {
        for pod in &self.pods {
            unsafe { pod.lock.destroy() };
        }
        // Dropping the now-owning mapping unmaps and unlinks.
        self.shmem.set_owner(true);
    }
}

fn pod_holds(view: &PodView, key: &[u8; KEY_LEN]) -> bool {
    (0..POD_DEPTH).any(|slot| view.key_at(slot) == &key[..])
}

/// One read step: find the first slot holding `key` at or after the
/// key's cursor, copy its value out, then advance the cursor to the
/// next occurrence so the following read returns the duplicate after
/// this one. With a single live occurrence the cursor stays on it.
/// Returns the hit slot and the value. The caller holds the pod's read
/// lock.
fn read_and_advance(
    view: &PodView,
    ipod: &mut PodIndex,
    key: &PodKey,
) -> Result<Option<(usize, Vec<u8>)>, StoreError> {
    let wanted = &key.slot_bytes()[..];
    // A handle that never touched this key scans from slot 0. That is
    // what lets a freshly attached process find data other processes
    // wrote before it arrived.
    let start = ipod.get(key.slot_bytes()).unwrap_or(0);

    for i in 0..POD_DEPTH {
        let slot = (start + i) % POD_DEPTH;
        if view.key_at(slot) != wanted {
            continue;
        }
        let value = extract_value(view.value_at(slot));
        let mut next = slot;
        for j in (i + 1)..POD_DEPTH {
            let candidate = (start + j) % POD_DEPTH;
            if view.key_at(candidate) == wanted {
                next = candidate;
                break;
            }
        }
        ipod.update(key.slot_bytes(), next)?;
        return Ok(Some((slot, value)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_in_range() {
        for key in &[&b"foo"[..], b"Bob Dylan", b"x", b"\xff\xfe\xfd"] {
            let pod = pod_for_key(key);
            assert_eq!(pod, pod_for_key(key));
            assert!(pod < NUM_PODS);
        }
    }

    #[test]
    fn hash_spreads_nearby_keys() {
        assert_ne!(pod_for_key(b"key-1"), pod_for_key(b"key-2"));
    }

    #[test]
    fn normalize_truncates_or_rejects() {
        let long = [b'a'; 40];
        let truncated = normalize_key(&long, OverflowPolicy::Truncate).unwrap();
        assert_eq!(truncated.logical(), &long[..KEY_LEN]);

        match normalize_key(&long, OverflowPolicy::Reject) {
            Err(StoreError::KeyTooLong(40)) => {}
            other => panic!("expected KeyTooLong, got {:?}", other.map(|k| k.len)),
        }

        assert!(matches!(
            normalize_key(b"", OverflowPolicy::Truncate),
            Err(StoreError::EmptyKey)
        ));
    }

    #[test]
    fn short_keys_are_zero_padded() {
        let key = normalize_key(b"foo", OverflowPolicy::Truncate).unwrap();
        assert_eq!(key.logical(), b"foo");
        assert_eq!(&key.slot_bytes()[..4], b"foo\0");
        assert!(key.slot_bytes()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn clamp_value_honors_the_policy() {
        let long = vec![b'v'; VALUE_LEN + 44];
        assert_eq!(
            clamp_value(&long, OverflowPolicy::Truncate).unwrap(),
            &long[..VALUE_LEN]
        );
        assert!(matches!(
            clamp_value(&long, OverflowPolicy::Reject),
            Err(StoreError::ValueTooLong(300))
        ));
        let short = b"v";
        assert_eq!(clamp_value(short, OverflowPolicy::Reject).unwrap(), short);
    }

    #[test]
    fn extract_value_stops_at_padding() {
        let mut raw = [0u8; VALUE_LEN];
        raw[..3].copy_from_slice(b"bar");
        assert_eq!(extract_value(&raw), b"bar");

        let full = [b'x'; VALUE_LEN];
        assert_eq!(extract_value(&full), vec![b'x'; VALUE_LEN]);

        assert_eq!(extract_value(&[0u8; VALUE_LEN]), Vec::<u8>::new());
    }
}
