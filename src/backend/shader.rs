// Shader module loading
//
// Compiled SPIR-V lives in `<root>/<name>.spv`. The bytes are checked for word
// alignment and the SPIR-V magic number before a module is created; beyond
// that the binary is opaque.

use ash::vk;
use std::path::{Path, PathBuf};

use super::device::LogicalDevice;
use crate::error::{EngineError, Result};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words. Either byte order is accepted.
pub fn parse_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    let invalid = |reason| EngineError::InvalidShader {
        name: name.to_string(),
        reason,
    };

    if bytes.is_empty() {
        return Err(invalid("file is empty"));
    }
    if bytes.len() % 4 != 0 {
        return Err(invalid("length is not a multiple of 4"));
    }

    let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))
        .map_err(|_| invalid("could not be read as 32-bit words"))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(invalid("missing SPIR-V magic number"));
    }
    Ok(words)
}

#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    root: PathBuf,
}

impl ShaderLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.spv", name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read and validate `<root>/<name>.spv`.
    pub fn load(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path_of(name);
        let bytes = std::fs::read(&path).map_err(|source| EngineError::Shader {
            name: name.to_string(),
            source,
        })?;
        let words = parse_spirv(name, &bytes)?;
        log::debug!("Loaded shader {:?} ({} words)", path, words.len());
        Ok(words)
    }

    pub fn create_module(&self, device: &LogicalDevice, name: &str) -> Result<vk::ShaderModule> {
        let words = self.load(name)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

        unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(device.creation_failed("shader module"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("frame-engine-{}-{}", test, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn accepts_both_byte_orders() {
        let little = spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000, 7]);
        assert_eq!(parse_spirv("tri", &little).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000, 7]);

        let big: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        assert_eq!(parse_spirv("tri", &big).unwrap()[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            parse_spirv("empty", &[]),
            Err(EngineError::InvalidShader { reason: "file is empty", .. })
        ));
        assert!(matches!(
            parse_spirv("short", &[0x03, 0x02, 0x23]),
            Err(EngineError::InvalidShader {
                reason: "length is not a multiple of 4",
                ..
            })
        ));
        assert!(matches!(
            parse_spirv("text", b"void main() {}  "),
            Err(EngineError::InvalidShader { .. })
        ));
    }

    #[test]
    fn loads_named_shader_from_root() {
        let dir = scratch_dir("load");
        std::fs::write(dir.join("clear.vert.spv"), spirv_bytes(&[SPIRV_MAGIC, 1, 2])).unwrap();
        let library = ShaderLibrary::new(&dir);

        assert_eq!(library.load("clear.vert").unwrap().len(), 3);
        assert!(matches!(
            library.load("missing"),
            Err(EngineError::Shader { ref name, .. }) if name == "missing"
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
