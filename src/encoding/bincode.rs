use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode("bincode value", e.to_string()))
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Decode("bincode value", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Vertex {
        id: u32,
        kind: String,
        active: bool,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = Vertex {
            id: 42,
            kind: "Process".to_string(),
            active: true,
        };

        let serialized = serialize(&original).unwrap();
        let deserialized: Vertex = deserialize(&serialized).unwrap();

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_primitive_types() {
        assert!(deserialize::<bool>(&serialize(&true).unwrap()).unwrap());
        assert_eq!(deserialize::<i64>(&serialize(&-42i64).unwrap()).unwrap(), -42);
        assert_eq!(
            deserialize::<String>(&serialize(&"hello world").unwrap()).unwrap(),
            "hello world"
        );
        assert_eq!(
            deserialize::<Vec<u8>>(&serialize(&vec![1u8, 2, 3]).unwrap()).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_truncated_data() {
        let bytes = serialize(&"a longer string value").unwrap();
        let result: Result<String> = deserialize(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(Error::Decode(_, _))));
    }
}
