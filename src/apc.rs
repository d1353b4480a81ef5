//! On-disk local-capture directory (spec §6 "Persisted state").
//!
//! The APC directory layout and full `captured.xml` generation are
//! explicitly out of scope (spec §1); this module is the external
//! collaborator's *interface*: enough directory management and minimal XML
//! emission for a local capture to produce a well-formed directory end to
//! end (spec §8 scenario S1), without claiming fidelity to the real
//! Streamline schema.
//!
//! Grounded on `cognitod/src/handler/mod.rs`'s `JsonlHandler` file-writing
//! shape (open/write/flush under ownership of one writer), generalized
//! from a single file to a directory of files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::session::Session;

pub struct CaptureDirectory {
    root: PathBuf,
}

impl CaptureDirectory {
    /// Removes the directory if it already exists, then recreates it
    /// (spec §6: "removed and recreated if it already exists at session
    /// start").
    pub fn create(root: &Path) -> std::io::Result<Self> {
        if root.exists() {
            fs::remove_dir_all(root)?;
        }
        fs::create_dir_all(root)?;
        Ok(CaptureDirectory {
            root: root.to_path_buf(),
        })
    }

    pub fn data_path(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn open_data_file(&self) -> std::io::Result<fs::File> {
        fs::File::create(self.data_path())
    }

    /// Minimal `captured.xml`: enough fields for a host-side tool to locate
    /// the data file and know the session parameters; real schema fidelity
    /// is the out-of-scope collaborator's job.
    pub fn write_captured_xml(&self, session: &Session, uname: &str) -> std::io::Result<()> {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<captured version=\"1\">\n");
        out.push_str(&format!(
            "  <target name=\"{}\" uname=\"{}\"/>\n",
            escape_xml(&hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or_default()),
            escape_xml(uname),
        ));
        out.push_str(&format!(
            "  <session system_wide=\"{}\" duration=\"{}\" sample_rate=\"{:?}\"/>\n",
            session.system_wide, session.duration_seconds, session.sample_rate
        ));
        out.push_str("</captured>\n");
        fs::write(self.root.join("captured.xml"), out)
    }

    pub fn write_events_xml(&self, events: &[(&str, &str)]) -> std::io::Result<()> {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<events>\n");
        for (key, title) in events {
            out.push_str(&format!(
                "  <event key=\"{}\" title=\"{}\"/>\n",
                escape_xml(key),
                escape_xml(title)
            ));
        }
        out.push_str("</events>\n");
        fs::write(self.root.join("events.xml"), out)
    }

    pub fn write_counters_xml(&self, session: &Session) -> std::io::Result<()> {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<counters>\n");
        let mut counters: Vec<_> = session.counters.values().collect();
        counters.sort_by_key(|c| c.key);
        for counter in counters {
            out.push_str(&format!(
                "  <counter name=\"{}\" key=\"{}\" event=\"{}\" driver=\"{}\"/>\n",
                escape_xml(&counter.name),
                counter.key,
                counter.event_code,
                escape_xml(&counter.driver),
            ));
        }
        out.push_str("</counters>\n");
        fs::write(self.root.join("counters.xml"), out)
    }

    /// Copies an image binary referenced by the session (e.g. a captured
    /// workload's executable) into the capture directory for later symbol
    /// resolution.
    pub fn copy_image(&self, src: &Path) -> std::io::Result<PathBuf> {
        let file_name = src
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
        let images_dir = self.root.join("images");
        fs::create_dir_all(&images_dir)?;
        let dest = images_dir.join(file_name);
        fs::copy(src, &dest)?;
        Ok(dest)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `uname -a`-equivalent string embedded in the Summary packet and
/// `captured.xml` (spec §6 SUMMARY packet, §8 scenario S1).
pub fn uname_string() -> String {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return String::from("unknown");
    }
    let field = |buf: &[libc::c_char]| -> String {
        let bytes: Vec<u8> = buf.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    };
    format!(
        "{} {} {} {} {}",
        field(&uts.sysname),
        field(&uts.nodename),
        field(&uts.release),
        field(&uts.version),
        field(&uts.machine),
    )
}

pub fn flush_all(f: &mut fs::File) -> std::io::Result<()> {
    f.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_removes_and_recreates_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let apc_dir = tmp.path().join("cap.apc");
        fs::create_dir_all(&apc_dir).unwrap();
        fs::write(apc_dir.join("stale.txt"), b"old").unwrap();

        let dir = CaptureDirectory::create(&apc_dir).unwrap();
        assert!(!apc_dir.join("stale.txt").exists());
        assert_eq!(dir.root(), apc_dir);
    }

    #[test]
    fn writes_well_formed_captured_xml() {
        let tmp = tempfile::tempdir().unwrap();
        let apc_dir = tmp.path().join("cap.apc");
        let dir = CaptureDirectory::create(&apc_dir).unwrap();
        let session = Session::new();
        dir.write_captured_xml(&session, "Linux test 6.1").unwrap();
        let contents = fs::read_to_string(apc_dir.join("captured.xml")).unwrap();
        assert!(contents.contains("<captured"));
        assert!(contents.contains("Linux test 6.1"));
    }

    #[test]
    fn counters_xml_lists_enabled_counters_sorted_by_key() {
        let tmp = tempfile::tempdir().unwrap();
        let apc_dir = tmp.path().join("cap.apc");
        let dir = CaptureDirectory::create(&apc_dir).unwrap();
        let mut session = Session::new();
        session.counters.insert(
            2,
            crate::session::Counter {
                name: "b".into(),
                key: 2,
                event_code: 5,
                sampling_period: 0,
                core_count: 1,
                driver: "perf".into(),
            },
        );
        session.counters.insert(
            1,
            crate::session::Counter {
                name: "a".into(),
                key: 1,
                event_code: 3,
                sampling_period: 0,
                core_count: 1,
                driver: "perf".into(),
            },
        );
        dir.write_counters_xml(&session).unwrap();
        let contents = fs::read_to_string(apc_dir.join("counters.xml")).unwrap();
        assert!(contents.find("key=\"1\"").unwrap() < contents.find("key=\"2\"").unwrap());
    }

    #[test]
    fn data_path_is_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let apc_dir = tmp.path().join("cap.apc");
        let dir = CaptureDirectory::create(&apc_dir).unwrap();
        assert_eq!(dir.data_path(), apc_dir.join("data"));
    }

    #[test]
    fn uname_string_is_nonempty() {
        assert!(!uname_string().is_empty());
    }
}
