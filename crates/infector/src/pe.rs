//! PE32+ header parsing. A thin, opinionated wrapper over
//! `goblin::pe` — we never interpret relocations; payloads must be linked
//! flat.

use crate::error::PeError;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

#[derive(Debug, Clone)]
pub struct PeImage {
    pub sections: Vec<Section>,
    pub image_base: u64,
    pub size_of_image: u32,
    pub entry_point_rva: u32,
    pub file_alignment: u32,
    pub section_alignment: u32,
}

impl PeImage {
    /// Parses a PE header out of `bytes`, which may be a full file read
    /// from disk or the first `HEADER_SIZE` bytes read from target memory.
    pub fn parse(bytes: &[u8]) -> Result<Self, PeError> {
        let pe = goblin::pe::PE::parse(bytes).map_err(|e| PeError::Malformed(e.to_string()))?;

        let opt = pe
            .header
            .optional_header
            .ok_or_else(|| PeError::Malformed("missing optional header".into()))?;

        let sections = pe
            .sections
            .iter()
            .map(|s| Section {
                name: s.name().unwrap_or("").trim_end_matches('\0').to_string(),
                virtual_address: s.virtual_address,
                pointer_to_raw_data: s.pointer_to_raw_data,
                size_of_raw_data: s.size_of_raw_data,
            })
            .collect();

        Ok(PeImage {
            sections,
            image_base: opt.windows_fields.image_base,
            size_of_image: opt.windows_fields.size_of_image,
            entry_point_rva: opt.standard_fields.address_of_entry_point,
            file_alignment: opt.windows_fields.file_alignment,
            section_alignment: opt.windows_fields.section_alignment,
        })
    }

    /// Payloads must satisfy `FileAlignment == SectionAlignment`
    /// so that raw file offsets equal RVAs.
    pub fn check_flat_layout(&self) -> Result<(), PeError> {
        if self.file_alignment != self.section_alignment {
            return Err(PeError::BadPayloadImage);
        }
        Ok(())
    }

    pub fn section_starting_with<'a>(&'a self, prefix: &str) -> Option<&'a Section> {
        self.sections.iter().find(|s| s.name.starts_with(prefix))
    }
}
