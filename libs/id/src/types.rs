//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// A managed microVM. Assigned by the caller that declares the machine.
    MachineId,
    "mach"
);

define_id!(
    /// A container declared inside a machine's spec.
    ContainerId,
    "ctr"
);

define_id!(
    /// A block volume, either an image root filesystem or a per-container copy.
    VolumeId,
    "vol"
);

define_id!(
    /// An allocated host network interface (TAP device plus address).
    InterfaceId,
    "nic"
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_machine_id_roundtrip() {
        let id = MachineId::new();
        let parsed: MachineId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("mach_"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let volume = VolumeId::new().to_string();
        let err = volume.parse::<MachineId>().unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_missing_separator() {
        let err = "mach01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<MachineId>().unwrap_err();
        assert_eq!(err, crate::IdError::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        assert_eq!("".parse::<ContainerId>().unwrap_err(), crate::IdError::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let err = "vol_not-a-ulid".parse::<VolumeId>().unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = InterfaceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: InterfaceId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_suffix_has_no_prefix() {
        let id = MachineId::new();
        assert_eq!(format!("mach_{}", id.suffix()), id.to_string());
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            MachineId::PREFIX,
            ContainerId::PREFIX,
            VolumeId::PREFIX,
            InterfaceId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_any_ulid_roundtrips(raw in any::<u128>()) {
            let id = MachineId::from_ulid(crate::Ulid::from(raw));
            let parsed: MachineId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
