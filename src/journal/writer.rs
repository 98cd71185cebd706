//! Appending packets to a zone's transfer journal.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

use super::{BEGIN_MARKER, END_MARKER};

/// Writes to `<zone>.xfrd.tmp` while a transfer is in flight; `finalize`
/// atomically rotates it into `<zone>.xfrd`, the name the journal reader
/// watches.
pub struct JournalWriter {
    tmp_path: Utf8PathBuf,
    final_path: Utf8PathBuf,
    file: File,
    in_packet: bool,
}

impl JournalWriter {
    /// Open (or create) the `.tmp` journal for `zone` under `dir`.
    /// `truncate` is set for an explicit retransfer or the start of a
    /// fresh AXFR; otherwise a resumed transfer appends.
    pub fn open(dir: &Utf8Path, zone: &str, truncate: bool) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let tmp_path = dir.join(format!("{zone}.xfrd.tmp"));
        let final_path = dir.join(format!("{zone}.xfrd"));

        let file = OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(truncate)
            .truncate(truncate)
            .open(&tmp_path)?;

        Ok(Self {
            tmp_path,
            final_path,
            file,
            in_packet: false,
        })
    }

    pub fn begin_packet(&mut self) -> io::Result<()> {
        debug_assert!(!self.in_packet, "begin_packet called while already in a packet");
        writeln!(self.file, "{BEGIN_MARKER}")?;
        self.in_packet = true;
        Ok(())
    }

    /// Append one verbatim master-file RR line.
    pub fn append_rr_line(&mut self, line: &str) -> io::Result<()> {
        debug_assert!(self.in_packet, "append_rr_line called outside a packet");
        writeln!(self.file, "{line}")
    }

    pub fn end_packet(&mut self) -> io::Result<()> {
        debug_assert!(self.in_packet, "end_packet called without a matching begin_packet");
        writeln!(self.file, "{END_MARKER}")?;
        self.file.flush()?;
        self.in_packet = false;
        Ok(())
    }

    /// Rotate the finished `.tmp` journal into its finalised name, ready
    /// for the journal reader.
    pub fn finalize(self) -> io::Result<()> {
        self.file.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_delimited_packets_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let mut writer = JournalWriter::open(dir, "example.com", true).unwrap();
        writer.begin_packet().unwrap();
        writer
            .append_rr_line("example.com. 3600 IN SOA ns1.example.com. hostmaster.example.com. 42 3600 300 604800 3600")
            .unwrap();
        writer.end_packet().unwrap();
        writer.finalize().unwrap();

        let contents = std::fs::read_to_string(dir.join("example.com.xfrd")).unwrap();
        assert!(contents.starts_with(";;BEGINPACKET\n"));
        assert!(contents.trim_end().ends_with(";;ENDPACKET"));
    }
}
