// Shader module loading
//
// SPIR-V is read from disk at startup and kept as words so the pipeline
// can be rebuilt later without touching the filesystem again.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Vertex and fragment SPIR-V words.
#[derive(Debug, Clone)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderCode {
    pub fn load(vertex: impl AsRef<Path>, fragment: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            vertex: read_spirv(vertex.as_ref())?,
            fragment: read_spirv(fragment.as_ref())?,
        })
    }
}

pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Could not open shader {:?}", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Re-align raw bytes into words, checking length and magic number.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    Ok(words)
}

/// Owned shader module, destroyed on drop once the pipeline has consumed it.
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a VulkanDevice, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn parses_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);

        assert!(parse_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(parse_spirv(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("exist.spv"));
    }
}
