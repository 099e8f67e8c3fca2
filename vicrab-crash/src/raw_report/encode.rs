// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emit::*;
use super::RawReport;
use std::io::{self, Write};

impl RawReport {
    /// Writes the report back out through the same emitters the capture
    /// path uses, in the order it writes blocks. Blocks this build does not
    /// know go last, right before the terminating line. A report that was
    /// never completed stays without one.
    pub fn encode(&self, w: &mut impl Write) -> io::Result<()> {
        emit_magic(w)?;
        emit_header(w, &self.header.as_line())?;
        if let Some(context) = &self.context {
            emit_context(w, &context.as_lines())?;
        }
        if let Some(system) = &self.system {
            emit_system(w, &system.as_line())?;
        }
        if let Some(user_context) = &self.user_context {
            emit_user_context(w, user_context)?;
        }
        if !self.breadcrumbs.is_empty() {
            let lines = self
                .breadcrumbs
                .iter()
                .map(|breadcrumb| breadcrumb.to_line())
                .collect::<Result<Vec<_>, _>>()
                .map_err(io::Error::other)?;
            emit_breadcrumbs(w, lines.iter().map(String::as_str))?;
        }
        if let Some(images) = &self.binary_images {
            emit_binary_images_begin(w)?;
            for image in images {
                emit_binary_image(w, &image.as_line())?;
            }
            emit_binary_images_end(w)?;
        }
        for thread in &self.threads {
            emit_thread_begin(w, &thread.as_line())?;
            emit_registers(
                w,
                thread
                    .registers
                    .iter()
                    .map(|(name, value)| (name.as_str(), *value)),
            )?;
            emit_frames_begin(w)?;
            for frame in &thread.frames {
                emit_frame(w, &frame.as_line())?;
            }
            emit_frames_end(w, thread.frames_truncated)?;
            if let Some(stack_dump) = &thread.stack_dump {
                emit_stack_dump_begin(w)?;
                for chunk in stack_dump {
                    emit_stack_chunk(
                        w,
                        &StackChunkLine {
                            address: chunk.address,
                            bytes: &chunk.bytes,
                        },
                    )?;
                }
                emit_stack_dump_end(w)?;
            }
            emit_thread_end(w)?;
        }
        for block in &self.unknown_blocks {
            emit_unknown_block(w, &block.name, &block.lines)?;
        }
        if self.complete {
            emit_done(w)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = vec![];
        self.encode(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::raw_report::{decode, decode_partial, DecodeError, RawReport, ReportType};
    use crate::test_utils::TestInstance;

    #[test]
    fn test_round_trip_is_byte_exact() {
        let report = RawReport::test_instance(1);
        let bytes = report.to_bytes().unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_round_trip_except_timestamp() {
        let report = RawReport::test_instance(2);
        let bytes = report.to_bytes().unwrap();
        let mut decoded = decode(&bytes).unwrap();
        decoded.header.timestamp_micros += 1_000_000;
        let reencoded = String::from_utf8(decoded.to_bytes().unwrap()).unwrap();
        let original = String::from_utf8(bytes).unwrap();
        let differing: Vec<_> = original
            .lines()
            .zip(reencoded.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(differing.len(), 1);
        assert!(differing[0].0.contains("\"timestamp_micros\""));
        assert_eq!(original.lines().count(), reencoded.lines().count());
    }

    #[test]
    fn test_empty_stack_dump_is_kept() {
        let mut report = RawReport::test_instance(5);
        report.threads[1].stack_dump = Some(vec![]);
        let bytes = report.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert_eq!(text.matches("VICRAB_CRASH_BEGIN_STACK_DUMP").count(), 2);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.threads[1].stack_dump, Some(vec![]));
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_images_come_before_threads() {
        let text = String::from_utf8(RawReport::test_instance(6).to_bytes().unwrap()).unwrap();
        let images = text.find("VICRAB_CRASH_BEGIN_BINARY_IMAGES").unwrap();
        let thread = text.find("VICRAB_CRASH_BEGIN_THREAD").unwrap();
        assert!(images < thread);
    }

    #[test]
    fn test_unknown_blocks_survive() {
        let report = RawReport::test_instance(3);
        let text = String::from_utf8(report.to_bytes().unwrap()).unwrap();
        let text = text.replace(
            "VICRAB_CRASH_DONE\n",
            "VICRAB_CRASH_BEGIN_GPU\n{\"driver\":\"x\"}\nVICRAB_CRASH_END_GPU\nVICRAB_CRASH_DONE\n",
        );
        let decoded = decode(text.as_bytes()).unwrap();
        assert_eq!(decoded.unknown_blocks.len(), 1);
        assert_eq!(decoded.unknown_blocks[0].name, "GPU");
        assert_eq!(String::from_utf8(decoded.to_bytes().unwrap()).unwrap(), text);
    }

    #[test]
    fn test_missing_terminator_is_partial() {
        let report = RawReport::test_instance(4);
        let text = String::from_utf8(report.to_bytes().unwrap()).unwrap();
        let cut = text.strip_suffix("VICRAB_CRASH_DONE\n").unwrap();
        let decoded = decode(cut.as_bytes()).unwrap();
        assert!(!decoded.complete);
        assert_eq!(decoded.threads, report.threads);
    }

    #[test]
    fn test_torn_report_decodes_partially() {
        let report = RawReport::test_instance(5);
        let text = String::from_utf8(report.to_bytes().unwrap()).unwrap();
        // Cut in the middle of the first frame line.
        let at = text.find("{\"ip\"").unwrap() + 10;
        let torn = &text.as_bytes()[..at];
        assert!(decode(torn).is_err());
        let partial = decode_partial(torn).unwrap();
        assert!(!partial.complete);
        assert_eq!(partial.header, report.header);
        assert!(partial.context.is_some());
        assert!(partial.threads.is_empty());
    }

    #[test]
    fn test_rejects_foreign_files() {
        assert!(matches!(decode(b"hello\n"), Err(DecodeError::MissingMagic)));
        assert!(matches!(
            decode(b"VICRAB_CRASH_REPORT 99\n"),
            Err(DecodeError::UnsupportedVersion(99))
        ));
        assert!(matches!(
            decode(b"VICRAB_CRASH_REPORT 1\nVICRAB_CRASH_DONE\n"),
            Err(DecodeError::MissingHeader)
        ));
    }

    #[test]
    fn test_recrash_marker_decodes() {
        let mut report = RawReport::test_instance(6);
        report.header.report_type = ReportType::Recrash;
        report.threads.clear();
        report.binary_images = None;
        let decoded = decode(&report.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.header.report_type, ReportType::Recrash);
        assert!(decoded.binary_images.is_none());
    }
}
