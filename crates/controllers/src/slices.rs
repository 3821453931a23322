//! ResourceSlice construction: synthesized manifests packed into
//! write-once slices owned by the composition.

use eno_core::api::{
    Composition, Manifest, OwnerReference, ResourceSlice, COMPOSITION_NAME_LABEL,
    SYNTHESIS_UUID_LABEL,
};

/// Packs manifests into slices of at most `max_bytes` each (always at
/// least one manifest per slice), preserving order. Slice names are
/// deterministic so ingestion retries are idempotent.
pub fn build_slices(
    comp: &Composition,
    synthesis_uuid: &str,
    manifests: Vec<Manifest>,
    max_bytes: usize,
) -> Vec<ResourceSlice> {
    let short = synthesis_uuid.get(..8).unwrap_or(synthesis_uuid);
    let mut slices: Vec<ResourceSlice> = Vec::new();
    let mut bucket: Vec<Manifest> = Vec::new();
    let mut bucket_bytes = 0usize;

    let flush = |slices: &mut Vec<ResourceSlice>, bucket: &mut Vec<Manifest>| {
        if bucket.is_empty() {
            return;
        }
        let mut slice = ResourceSlice::new(
            comp.metadata.namespace.clone(),
            format!("{}-{}-{}", comp.metadata.name, short, slices.len()),
        );
        slice.metadata.labels.insert(COMPOSITION_NAME_LABEL.into(), comp.metadata.name.clone());
        slice.metadata.labels.insert(SYNTHESIS_UUID_LABEL.into(), synthesis_uuid.to_string());
        slice.metadata.owner_references.push(OwnerReference {
            api_version: eno_core::api::API_VERSION.into(),
            kind: Composition::KIND.into(),
            name: comp.metadata.name.clone(),
            uid: comp.metadata.uid.clone(),
            controller: true,
        });
        slice.spec.resources = std::mem::take(bucket);
        slices.push(slice);
    };

    for manifest in manifests {
        let size = manifest.manifest.len();
        if !bucket.is_empty() && bucket_bytes + size > max_bytes {
            flush(&mut slices, &mut bucket);
            bucket_bytes = 0;
        }
        bucket_bytes += size;
        bucket.push(manifest);
    }
    flush(&mut slices, &mut bucket);
    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(size: usize) -> Manifest {
        Manifest { manifest: "x".repeat(size), deleted: false }
    }

    #[test]
    fn packs_by_byte_budget() {
        let comp = Composition::new("default", "comp");
        let slices = build_slices(
            &comp,
            "0123456789abcdef",
            vec![manifest(40), manifest(40), manifest(40)],
            100,
        );
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].spec.resources.len(), 2);
        assert_eq!(slices[1].spec.resources.len(), 1);
        assert_eq!(slices[0].metadata.name, "comp-01234567-0");
        assert_eq!(slices[1].metadata.name, "comp-01234567-1");
    }

    #[test]
    fn oversized_manifest_gets_its_own_slice() {
        let comp = Composition::new("default", "comp");
        let slices = build_slices(&comp, "u", vec![manifest(500), manifest(10)], 100);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].spec.resources[0].manifest.len(), 500);
    }

    #[test]
    fn slices_carry_owner_and_labels() {
        let mut comp = Composition::new("default", "comp");
        comp.metadata.uid = Some("uid-1".into());
        let slices = build_slices(&comp, "uuid-x", vec![manifest(1)], 100);
        let slice = &slices[0];
        assert_eq!(slice.metadata.labels.get(COMPOSITION_NAME_LABEL).unwrap(), "comp");
        assert_eq!(slice.metadata.labels.get(SYNTHESIS_UUID_LABEL).unwrap(), "uuid-x");
        let owner = &slice.metadata.owner_references[0];
        assert!(owner.controller);
        assert_eq!(owner.kind, Composition::KIND);
        assert_eq!(owner.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn empty_output_builds_no_slices() {
        let comp = Composition::new("default", "comp");
        assert!(build_slices(&comp, "u", vec![], 100).is_empty());
    }
}
