//! Local filesystem capability.
//!
//! Directory enumeration, ranged reads for upload sources, and the download
//! side: a preallocated `.part` file (fallocate on unix when available, else
//! set_len) that accepts concurrent offset writes from several tasks and is
//! atomically renamed to its final name once every chunk has landed.

mod builder;
mod fs_ops;
mod writer;

pub use builder::StorageWriterBuilder;
pub use fs_ops::{file_size, list_directory, read_file_range, DirEntry};
pub use writer::StorageWriter;

/// Suffix of a download that has not been finalized yet.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path (e.g. `file.iso` → `file.iso.part`).
pub fn temp_path(final_path: &std::path::Path) -> std::path::PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    std::path::PathBuf::from(o)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn temp_path_appends_part() {
        let p = temp_path(Path::new("file.iso"));
        assert_eq!(p.to_string_lossy(), "file.iso.part");
        let p2 = temp_path(Path::new("/tmp/archive.zip"));
        assert_eq!(p2.to_string_lossy(), "/tmp/archive.zip.part");
    }

    #[test]
    fn chunks_written_out_of_order_then_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("nested").join("output.bin");
        let tp = temp_path(&final_path);

        let mut builder = StorageWriterBuilder::create(&tp).unwrap();
        builder.preallocate(12).unwrap();
        let writer = builder.build();
        let w2 = writer.clone();
        w2.write_at(8, b"ijkl").unwrap();
        writer.write_at(0, b"abcd").unwrap();
        w2.write_at(4, b"efgh").unwrap();
        writer.sync().unwrap();
        drop(w2);
        writer.finalize(&final_path).unwrap();

        assert!(!tp.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"abcdefghijkl");
    }

    #[test]
    fn resumed_writer_keeps_earlier_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("out.bin");
        let tp = temp_path(&final_path);
        {
            let mut builder = StorageWriterBuilder::create(&tp).unwrap();
            builder.preallocate(8).unwrap();
            builder.build().write_at(0, b"1234").unwrap();
        }
        let writer = StorageWriter::open_existing(&tp).unwrap();
        writer.write_at(4, b"5678").unwrap();
        writer.finalize(&final_path).unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"12345678");
    }

    #[test]
    fn zero_length_file_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("empty");
        let mut builder = StorageWriterBuilder::create(&temp_path(&final_path)).unwrap();
        builder.preallocate(0).unwrap();
        builder.build().finalize(&final_path).unwrap();
        assert_eq!(std::fs::metadata(&final_path).unwrap().len(), 0);
    }
}
