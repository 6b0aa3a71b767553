use binpack::codec::CodecId;
use binpack::container::{Container, ContainerOptions, SearchOptions};
use binpack::count::{count, CountError, CountOptions};
use binpack::record::Document;
use binpack::writer::ContainerWriter;
use rand::RngCore;
use regex::bytes::Regex;
use std::path::Path;
use tempfile::NamedTempFile;

fn random_content(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn write_container(path: &Path, docs: &[Document], codec: CodecId) -> Vec<u64> {
    let mut writer = ContainerWriter::create(path, codec, CodecId::None).unwrap();
    let offsets = docs.iter().map(|d| writer.write(d).unwrap()).collect();
    writer.finish().unwrap();
    offsets
}

#[test]
fn test_count_search_read_scenario() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let docs: Vec<Document> = ["a", "bb", "ccc"]
        .iter()
        .map(|k| Document::new(*k, random_content(100)))
        .collect();
    let offsets = write_container(&path, &docs, CodecId::Gzip);

    let opts = CountOptions { workers: 1, ..CountOptions::default() };
    assert_eq!(count(&path, CodecId::Gzip, &opts).unwrap(), 3);

    let mut container = Container::open(&path, ContainerOptions::default()).unwrap();
    let found = container
        .search(&SearchOptions::new(Regex::new("^bb$").unwrap()))
        .unwrap()
        .unwrap();
    assert_eq!(found, offsets[1]);

    let doc = container.read_at(found).unwrap().unwrap();
    assert_eq!(doc.key, b"bb");
    assert_eq!(doc.content, docs[1].content);
}

#[test]
fn test_every_codec_counts_and_reads() {
    for codec in CodecId::ALL {
        let temp_file = NamedTempFile::new().unwrap();
        let docs: Vec<Document> = (0..40)
            .map(|i| Document::new(format!("doc/{i:03}"), format!("{{\"n\":{i}}}").repeat(i % 5 + 1)))
            .collect();
        write_container(temp_file.path(), &docs, codec);

        let opts = CountOptions { workers: 1, key_only: true, ..CountOptions::default() };
        assert_eq!(count(temp_file.path(), codec, &opts).unwrap(), 40, "codec {codec}");

        let mut container = Container::open(temp_file.path(), ContainerOptions { codec, ..Default::default() }).unwrap();
        let read: Vec<Document> = container.documents(0, false).unwrap().map(|r| r.unwrap().1).collect();
        assert_eq!(read, docs, "codec {codec}");
    }
}

#[test]
fn test_multi_worker_count_on_codecs_with_framing() {
    for codec in [CodecId::Gzip, CodecId::Lz4, CodecId::Xz, CodecId::Zstd, CodecId::Bzip2] {
        let temp_file = NamedTempFile::new().unwrap();
        let docs: Vec<Document> = (0..200)
            .map(|i| Document::new(format!("k{i}"), random_content(20 + i % 90)))
            .collect();
        write_container(temp_file.path(), &docs, codec);
        for workers in [2, 4, 8] {
            let opts = CountOptions { workers, ..CountOptions::default() };
            assert_eq!(count(temp_file.path(), codec, &opts).unwrap(), 200, "codec {codec} workers {workers}");
        }
    }
}

#[test]
fn test_corruption_is_skipped_or_reported() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();
    let docs: Vec<Document> = (0..30)
        .map(|i| Document::new(format!("key-{i}"), random_content(64)))
        .collect();
    let offsets = write_container(path, &docs, CodecId::Gzip);

    // Flip a byte in the middle of record 9's content.
    let mut bytes = std::fs::read(path).unwrap();
    let header = 4 + docs[9].key.len() + 4;
    let mid = offsets[9] as usize + header + (offsets[10] - offsets[9]) as usize / 2 - header / 2;
    bytes[mid] ^= 0x5a;
    std::fs::write(path, &bytes).unwrap();

    for workers in [1, 2, 4] {
        let lenient = CountOptions { workers, skip_on_error: true, ..CountOptions::default() };
        assert_eq!(count(path, CodecId::Gzip, &lenient).unwrap(), 29);

        let strict = CountOptions { workers, ..CountOptions::default() };
        assert!(matches!(count(path, CodecId::Gzip, &strict), Err(CountError::Partition { .. })));
    }
}

#[test]
fn test_resync_from_inside_record() {
    let temp_file = NamedTempFile::new().unwrap();
    let docs: Vec<Document> = (0..5).map(|i| Document::new(format!("r{i}"), random_content(50))).collect();
    let offsets = write_container(temp_file.path(), &docs, CodecId::Gzip);

    let mut container = Container::open(temp_file.path(), ContainerOptions::default()).unwrap();
    let (at, doc) = container.next_valid(0, None).unwrap().unwrap();
    assert_eq!((at, doc.key.as_slice()), (offsets[0], b"r0".as_slice()));
    for k in 0..4 {
        let (at, _) = container.next_valid(offsets[k] + 1, None).unwrap().unwrap();
        assert_eq!(at, offsets[k + 1]);
    }
    assert!(container.next_valid(offsets[4] + 1, None).unwrap().is_none());
}
