//! Device path to drive letter mapping.
//!
//! File objects are named by their NT device path
//! (`\Device\HarddiskVolume2\Windows\notepad.exe`); [`DevMapper`] rewrites
//! the device prefix into the DOS drive (`C:\Windows\notepad.exe`).

/// Rewrites a native device path into its drive-letter form.
pub trait DevMapper: Send + Sync {
    fn convert(&self, path: &str) -> String;
}

/// Mapper over a fixed device → drive table.
#[derive(Debug, Default, Clone)]
pub struct DeviceMap {
    // (device, drive), longest device first so nested devices win
    mappings: Vec<(String, String)>,
}

impl DeviceMap {
    pub fn new<I, D, L>(mappings: I) -> Self
    where
        I: IntoIterator<Item = (D, L)>,
        D: Into<String>,
        L: Into<String>,
    {
        let mut mappings: Vec<(String, String)> = mappings
            .into_iter()
            .map(|(d, l)| (d.into(), l.into()))
            .collect();
        mappings.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { mappings }
    }

    /// Builds the table from the live DOS device namespace. Off Windows the
    /// table is empty and paths pass through unchanged.
    pub fn from_system() -> Self {
        #[cfg(windows)]
        {
            let map = Self::new(sys::dos_devices());
            log::info!("loaded {} DOS device mapping(s)", map.len());
            map
        }
        #[cfg(not(windows))]
        {
            Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl DevMapper for DeviceMap {
    fn convert(&self, path: &str) -> String {
        for (device, drive) in &self.mappings {
            let Some(head) = path.get(..device.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(device) {
                continue;
            }
            let rest = &path[device.len()..];
            if rest.is_empty() || rest.starts_with('\\') {
                return format!("{drive}{rest}");
            }
        }
        path.to_owned()
    }
}

#[cfg(windows)]
mod sys {
    use windows_sys::Win32::Storage::FileSystem::QueryDosDeviceW;

    /// `(\Device\HarddiskVolumeN, C:)` for every mapped drive letter.
    pub(super) fn dos_devices() -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut buf = vec![0u16; 1024];
        for letter in b'A'..=b'Z' {
            let drive = format!("{}:", letter as char);
            let wide: Vec<u16> = drive.encode_utf16().chain(Some(0)).collect();
            let n = unsafe { QueryDosDeviceW(wide.as_ptr(), buf.as_mut_ptr(), buf.len() as u32) };
            if n == 0 {
                continue;
            }
            // multi-sz: first entry is the active target
            let end = buf.iter().position(|&c| c == 0).unwrap_or(n as usize);
            let device = String::from_utf16_lossy(&buf[..end]);
            if !device.is_empty() {
                out.push((device, drive));
            }
        }
        out
    }
}
