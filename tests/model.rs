use std::collections::HashMap;

use proptest::prelude::*;
use tempfile::TempDir;
use tiermap::{CacheConfig, ExternalMap, MapConfig, ScreenConfig, StoreConfig};

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u32),
    Get(u16),
    Contains(u16),
    Remove(u16),
}

fn op() -> impl Strategy<Value = Op> {
    // A small key space so puts, removes and reads collide often.
    let key = 0u16..64;
    prop_oneof![
        4 => (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => key.clone().prop_map(Op::Get),
        1 => key.clone().prop_map(Op::Contains),
        1 => key.prop_map(Op::Remove),
    ]
}

fn check_against_model(map: &ExternalMap<u16, u32>, ops: &[Op], maximum_size: usize) {
    let mut model: HashMap<u16, u32> = HashMap::new();

    for op in ops {
        match op {
            Op::Put(k, v) => {
                map.put(*k, *v).unwrap();
                model.insert(*k, *v);
            }
            Op::Get(k) => assert_eq!(map.get(k).unwrap(), model.get(k).copied()),
            Op::Contains(k) => assert_eq!(map.contains(k).unwrap(), model.contains_key(k)),
            Op::Remove(k) => {
                map.remove(k).unwrap();
                model.remove(k);
            }
        }
        assert!(map.stats().cache_count <= maximum_size);
    }

    for (k, v) in &model {
        assert_eq!(map.get(k).unwrap(), Some(*v));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn memory_map_behaves_like_hashmap(
        ops in prop::collection::vec(op(), 1..300),
        maximum_size in 0usize..8,
    ) {
        let config = MapConfig::new("model", StoreConfig::memory())
            .screen(ScreenConfig::create(64, 0.05))
            .cache(CacheConfig::default().maximum_size(maximum_size));
        let map = ExternalMap::with_bincode(&config).unwrap();

        check_against_model(&map, &ops, maximum_size);
        map.close().unwrap();
    }

    #[test]
    fn log_map_behaves_like_hashmap(
        ops in prop::collection::vec(op(), 1..150),
        maximum_size in 0usize..4,
    ) {
        let dir = TempDir::new().unwrap();
        let config = MapConfig::new("model", StoreConfig::log(dir.path()))
            .cache(CacheConfig::default().maximum_size(maximum_size))
            .flush_on_close(true);
        let map = ExternalMap::with_bincode(&config).unwrap();

        check_against_model(&map, &ops, maximum_size);
        map.close().unwrap();
    }
}
