//! Whole-file round trips across formats and codecs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use linear::codec::{Codec, CodecContext, CodecKind, CompressionService};
use linear::region::anvil::{AnvilRegion, COMPRESSION_ZLIB};
use linear::region::convert::RegionConverter;
use linear::region::linear::{LinearReader, LinearWriter};
use linear::region::RegionFormat;


fn service(kind: CodecKind) -> Arc<CompressionService> {
    Arc::new(CompressionService::with_codecs(
        Codec::new(kind, kind.default_level()),
        Some(Codec::new(kind.default_fallback(), kind.default_fallback().default_level())),
        CodecContext::Migration,
    ))
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn payload(seed: usize) -> Vec<u8> {
    let mut data = vec![0x0A];
    data.extend((1..300 + seed * 7).map(|i| ((i * (seed + 3)) % 251) as u8));
    data
}

fn anvil_chunks(path: &Path, service: &CompressionService) -> BTreeMap<(i32, i32), Vec<u8>> {
    let mut region = AnvilRegion::open(path, false).unwrap();
    let occupied = region.occupied().collect::<Vec<_>>();
    occupied.into_iter()
        .map(|(lx, lz)| {
            let chunk = region.read_chunk(lx, lz).unwrap();
            ((lx, lz), chunk.decompress(service).unwrap())
        })
        .collect()
}

#[test]
fn mca_to_lrf_to_mca_preserves_chunks() {

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let mid = dir.path().join("mid");
    let back = dir.path().join("back");
    std::fs::create_dir_all(&src).unwrap();

    // Scattered local coordinates, including the slot corners.
    let coords = [(0, 0), (31, 0), (0, 31), (31, 31), (7, 19), (16, 16)];
    let mca = src.join("r.0.0.mca");
    {
        let mut region = AnvilRegion::open(&mca, true).unwrap();
        for (i, (lx, lz)) in coords.iter().enumerate() {
            region.write_chunk(*lx, *lz, COMPRESSION_ZLIB, &zlib(&payload(i))).unwrap();
        }
    }

    let service = service(CodecKind::Zstd);
    let converter = RegionConverter::new(Arc::clone(&service));

    let report = converter.convert_directory(&src, &mid, RegionFormat::Linear).unwrap();
    assert_eq!(report.summary(), "1 succeeded, 0 failed");

    let report = converter.convert_directory(&mid, &back, RegionFormat::Anvil).unwrap();
    assert_eq!(report.summary(), "1 succeeded, 0 failed");

    let original = anvil_chunks(&mca, &service);
    let round_tripped = anvil_chunks(&back.join("r.0.0.mca"), &service);

    // Same occupied slots, byte-identical payloads after decompression.
    assert_eq!(original.len(), coords.len());
    assert_eq!(original, round_tripped);

}

#[test]
fn lrf_codec_change_preserves_payloads() {

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("r.0.0.lrf");
    let second = dir.path().join("r.0.1.lrf");

    let zstd = service(CodecKind::Zstd);
    let lz4 = service(CodecKind::Lz4);

    let payloads = (0..10).map(payload).collect::<Vec<_>>();

    let mut writer = LinearWriter::create(&first, zstd.primary().magic()).unwrap();
    for (i, data) in payloads.iter().enumerate() {
        let blob = zstd.compress(data).unwrap();
        writer.append(i as i32, -(i as i32), &blob, data.len() as u32).unwrap();
    }
    writer.finish().unwrap();

    // Re-encode every chunk with the other codec.
    let mut reader = LinearReader::open(&first).unwrap();
    let mut writer = LinearWriter::create(&second, lz4.primary().magic()).unwrap();
    for chunk in reader.read_all().unwrap() {
        let data = zstd.decompress(&chunk.data).unwrap();
        let blob = lz4.compress(&data).unwrap();
        assert_eq!(blob[0], 0x4C);
        writer.append(chunk.cx, chunk.cz, &blob, data.len() as u32).unwrap();
    }
    writer.finish().unwrap();

    let mut reader = LinearReader::open(&second).unwrap();
    assert_eq!(reader.len(), payloads.len());
    for (i, data) in payloads.iter().enumerate() {
        let chunk = reader.read_chunk(i as i32, -(i as i32)).unwrap().unwrap();
        assert_eq!(&lz4.decompress(&chunk.data).unwrap(), data);
    }

}
