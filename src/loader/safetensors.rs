use std::path::Path;

use ::safetensors::{Dtype, SafeTensors};
use tracing::debug;

use crate::loader::{f32_tensor, LoaderError, WeightLoader, WeightStore};

/// Reads `.safetensors` weight files. F32 tensors are taken as-is, F64 is narrowed.
pub struct SafetensorsLoader;

impl SafetensorsLoader {
    pub fn from_bytes(bytes: &[u8]) -> Result<WeightStore, LoaderError> {
        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| LoaderError::InvalidFormat(format!("SafeTensors parse error: {e}")))?;

        let mut builder = WeightStore::builder();
        let mut entries = tensors.tensors();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, view) in entries {
            let data = match view.dtype() {
                Dtype::F32 => view.data().to_vec(),
                Dtype::F64 => view
                    .data()
                    .chunks_exact(8)
                    .flat_map(|c| {
                        let v = f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
                        (v as f32).to_le_bytes()
                    })
                    .collect(),
                other => {
                    return Err(LoaderError::UnsupportedDataType {
                        name,
                        dtype: format!("{other:?}"),
                    })
                }
            };
            builder = builder.insert(f32_tensor(&name, view.shape(), data))?;
        }
        let store = builder.build();
        debug!(weights = store.len(), "loaded safetensors weights");
        Ok(store)
    }
}

impl WeightLoader for SafetensorsLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<WeightStore, LoaderError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn safetensors_bytes(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_load_safetensors_f32() {
        let payload: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let header = r#"{"fc.weight":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.safetensors");
        File::create(&file_path)
            .unwrap()
            .write_all(&safetensors_bytes(header, &payload))
            .unwrap();

        let store = SafetensorsLoader::load(&file_path).unwrap();
        let w = store.values("fc.weight").unwrap();
        assert_eq!(w.shape(), &[2, 2]);
        assert_eq!(w.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_load_safetensors_rejects_integer_weights() {
        let header = r#"{"steps":{"dtype":"I64","shape":[1],"data_offsets":[0,8]}}"#;
        let result = SafetensorsLoader::from_bytes(&safetensors_bytes(header, &[0; 8]));
        assert!(matches!(result, Err(LoaderError::UnsupportedDataType { .. })));
    }

    #[test]
    fn test_load_safetensors_invalid_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.safetensors");
        File::create(&file_path).unwrap();

        let result = SafetensorsLoader::load(&file_path);
        assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
    }
}
