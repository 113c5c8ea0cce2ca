//! Worker-side filesystem plumbing: streaming tar.gz pack/unpack for
//! directory transfers, bounded file reads for the read directives, and
//! the contained-path resolution that keeps reads inside a bundle.

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::warn;

use longshore_bundle::fsutil::{normalize_path, remove_path};

#[derive(Debug, Error)]
pub enum PathError {
    #[error("{path} is not a valid path within bundle {uuid}")]
    Outside { uuid: String, path: String },
}

/// Resolves `subpath` inside the bundle rooted at `bundle_path`, rejecting
/// anything that would escape the root (`..`, absolute paths).
pub fn get_target_path(
    bundle_path: &Path,
    uuid: &str,
    subpath: &str,
) -> Result<PathBuf, PathError> {
    let relative = Path::new(subpath);
    if relative.is_absolute()
        || !longshore_bundle::fsutil::path_is_contained(bundle_path, relative)
    {
        return Err(PathError::Outside {
            uuid: uuid.to_string(),
            path: subpath.to_string(),
        });
    }
    Ok(normalize_path(&bundle_path.join(relative)))
}

/// Total size of a file or directory tree, computed off the runtime's
/// blocking pool; the disk sampler calls this on large, hot trees.
pub async fn path_size(path: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            total += entry.metadata().map_err(io::Error::other)?.len();
        }
        Ok(total)
    })
    .await?
}

/// Streams `path` as a gzipped tarball. Top-level names in `exclude` are
/// skipped (dependency mounts are not part of a bundle's results).
pub fn tar_gz_directory_stream(
    path: PathBuf,
    exclude: Vec<String>,
) -> Box<dyn AsyncRead + Send + Unpin> {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let result: io::Result<()> = async {
            let encoder = GzipEncoder::new(writer);
            let mut builder = tokio_tar::Builder::new(encoder);
            let mut entries = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if exclude.contains(&name) {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    builder.append_dir_all(&name, entry.path()).await?;
                } else {
                    builder.append_path_with_name(entry.path(), &name).await?;
                }
            }
            let mut encoder = builder.into_inner().await?;
            encoder.shutdown().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(path=?path, err=%e, "directory streaming failed");
        }
    });
    Box::new(reader)
}

/// Unpacks a gzipped tarball into `dest`, replacing whatever is there.
pub async fn un_tar_gz_directory(
    reader: impl AsyncRead + Send + Unpin,
    dest: &Path,
) -> io::Result<()> {
    remove_path(dest)?;
    tokio::fs::create_dir_all(dest).await?;
    let decoder = GzipDecoder::new(BufReader::new(reader));
    let mut archive = tokio_tar::Archive::new(decoder);
    archive.unpack(dest).await
}

/// Streams a single file gzipped.
pub fn gzip_file_stream(path: PathBuf) -> Box<dyn AsyncRead + Send + Unpin> {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let result: io::Result<()> = async {
            let mut file = tokio::fs::File::open(&path).await?;
            let mut encoder = GzipEncoder::new(writer);
            tokio::io::copy(&mut file, &mut encoder).await?;
            encoder.shutdown().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(path=?path, err=%e, "file streaming failed");
        }
    });
    Box::new(reader)
}

/// Gzips a byte string in memory.
pub async fn gzip_bytes(mut data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = async_compression::tokio::bufread::GzipEncoder::new(&mut data);
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Reads `length` bytes starting at `offset`.
pub async fn read_file_section(path: &Path, offset: u64, length: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buffer = Vec::with_capacity(length.min(1 << 20) as usize);
    file.take(length).read_to_end(&mut buffer).await?;
    Ok(buffer)
}

/// Returns the first `num_head_lines` and last `num_tail_lines` of a text
/// file, with `truncation_text` marking the gap. Reads at most
/// `lines × max_line_length` bytes from each end, so a multi-gigabyte run
/// log never gets pulled into memory whole.
pub async fn summarize_file(
    path: &Path,
    num_head_lines: usize,
    num_tail_lines: usize,
    max_line_length: usize,
    truncation_text: &str,
) -> io::Result<String> {
    if num_head_lines == 0 && num_tail_lines == 0 {
        return Ok(String::new());
    }

    let file_size = tokio::fs::metadata(path).await?.len();
    let head_budget = (num_head_lines * max_line_length) as u64;
    let tail_budget = (num_tail_lines * max_line_length) as u64;

    let mut file = tokio::fs::File::open(path).await?;
    let lines = if file_size > head_budget + tail_budget {
        let mut lines = Vec::new();
        if num_head_lines > 0 {
            let mut head = Vec::with_capacity(head_budget as usize);
            (&mut file).take(head_budget).read_to_end(&mut head).await?;
            let text = String::from_utf8_lossy(&head);
            let mut head_lines: Vec<String> = split_keeping_newlines(&text)
                .into_iter()
                .take(num_head_lines)
                .collect();
            // The read may have cut the last line short; only whole lines
            // end with a newline, so a partial one is dropped.
            ensure_ends_with_newline(&mut head_lines, true);
            lines.extend(head_lines);
        }
        if num_tail_lines > 0 {
            if num_head_lines > 0 {
                lines.push(truncation_text.to_string());
            }
            // Read one byte early and always drop the first line: if the
            // cut landed on a newline that line is empty, otherwise it is
            // partial; either way it goes.
            file.seek(io::SeekFrom::Start(file_size - tail_budget - 1))
                .await?;
            let mut tail = Vec::with_capacity(tail_budget as usize);
            (&mut file).take(tail_budget).read_to_end(&mut tail).await?;
            let text = String::from_utf8_lossy(&tail);
            let mut tail_lines = split_keeping_newlines(&text);
            if !tail_lines.is_empty() {
                tail_lines.remove(0);
            }
            let keep_from = tail_lines.len().saturating_sub(num_tail_lines);
            let mut tail_lines = tail_lines.split_off(keep_from);
            ensure_ends_with_newline(&mut tail_lines, false);
            lines.extend(tail_lines);
        }
        lines
    } else {
        // Small file; both ends fit the budget, so read it once.
        let mut contents = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut contents).await?;
        let text = String::from_utf8_lossy(&contents);
        let mut all = split_keeping_newlines(&text);
        ensure_ends_with_newline(&mut all, false);
        if all.len() > num_head_lines + num_tail_lines {
            if num_head_lines > 0 && num_tail_lines > 0 {
                let tail = all.split_off(all.len() - num_tail_lines);
                all.truncate(num_head_lines);
                all.push(truncation_text.to_string());
                all.extend(tail);
            } else if num_head_lines > 0 {
                all.truncate(num_head_lines);
            } else {
                all = all.split_off(all.len() - num_tail_lines);
            }
        }
        all
    };
    Ok(lines.concat())
}

/// `splitlines(keepends)` for `\n`-terminated text: each element keeps its
/// trailing newline, a final unterminated line comes through as-is.
fn split_keeping_newlines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    // `\n` is ascii, so these indices always sit on char boundaries.
    for (index, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(text[start..=index].to_string());
            start = index + 1;
        }
    }
    if start < text.len() {
        lines.push(text[start..].to_string());
    }
    lines
}

fn ensure_ends_with_newline(lines: &mut Vec<String>, remove_line_without_newline: bool) {
    if let Some(last) = lines.last_mut() {
        if !last.ends_with('\n') {
            if remove_line_without_newline {
                lines.pop();
            } else {
                last.push('\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::inside("out/stdout", true)]
    #[case::root("", true)]
    #[case::escape("../other", false)]
    #[case::sneaky("out/../../other", false)]
    #[case::absolute("/etc/passwd", false)]
    fn target_path_containment(#[case] subpath: &str, #[case] is_ok: bool) {
        let result = get_target_path(Path::new("/work/runs/0x1"), "0x1", subpath);
        assert_eq!(result.is_ok(), is_ok, "{:?}", subpath);
    }

    #[tokio::test]
    async fn tar_roundtrip_excludes_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bundle");
        std::fs::create_dir_all(source.join("out")).unwrap();
        std::fs::write(source.join("out/stdout"), b"results").unwrap();
        std::fs::create_dir(source.join("dep")).unwrap();
        std::fs::write(source.join("dep/ignored"), b"dependency").unwrap();

        let stream = tar_gz_directory_stream(source, vec!["dep".to_string()]);
        let dest = dir.path().join("unpacked");
        un_tar_gz_directory(stream, &dest).await.unwrap();

        assert_eq!(std::fs::read(dest.join("out/stdout")).unwrap(), b"results");
        assert!(!dest.join("dep").exists());
    }

    #[tokio::test]
    async fn file_section_reads_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        assert_eq!(read_file_section(&path, 2, 4).await.unwrap(), b"2345");
        assert_eq!(read_file_section(&path, 8, 100).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn summaries_keep_head_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let body: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        tokio::fs::write(&path, body).await.unwrap();

        let summary = summarize_file(&path, 2, 2, 80, "...\n").await.unwrap();
        assert!(summary.starts_with("line 0\nline 1\n...\n"));
        assert!(summary.ends_with("line 8\nline 9\n"));
    }

    #[tokio::test]
    async fn summaries_of_large_files_read_only_the_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let body: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        tokio::fs::write(&path, body).await.unwrap();

        // 790 bytes of log against a 2 x 2 x 16 byte budget: only the ends
        // get read, whole lines only.
        let summary = summarize_file(&path, 2, 2, 16, "...\n").await.unwrap();
        assert!(summary.starts_with("line 0\nline 1\n...\n"));
        assert!(summary.ends_with("line 98\nline 99\n"));
        assert!(!summary.contains("line 50"));
    }

    #[tokio::test]
    async fn summaries_tolerate_multibyte_cut_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let body: String = (0..50).map(|i| format!("héllö wörld №{}\n", i)).collect();
        tokio::fs::write(&path, body).await.unwrap();

        // A 22-byte head budget cuts the second line mid-`é`; the summary
        // must come back without panicking, whole lines only.
        let summary = summarize_file(&path, 1, 1, 22, "...\n").await.unwrap();
        assert!(summary.starts_with("héllö wörld №0\n"));
        assert!(summary.contains("héllö wörld №49\n"));
    }
}
