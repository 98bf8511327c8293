// End-to-end analysis of synthetic firmware images
mod fixtures;

#[cfg(test)]
mod tests {
    use super::fixtures;
    use fwcrypt_core::engine::compliance::{ComplianceScorer, RiskLevel, Ruleset};
    use fwcrypt_core::engine::image::{Architecture, ContainerFormat};
    use fwcrypt_core::engine::loader::Loader;
    use fwcrypt_core::engine::matcher::PrimitiveKind;
    use fwcrypt_core::engine::pipeline::{Pipeline, Uncancellable};
    use fwcrypt_core::{AnalysisError, AnalysisReport, ErrorCategory};
    use std::sync::Arc;

    fn analyze(data: Arc<[u8]>, name: &str) -> Result<AnalysisReport, AnalysisError> {
        let ruleset = Ruleset::embedded().unwrap();
        Pipeline::default().run(data, Some(name), &ruleset, &Uncancellable)
    }

    #[test]
    fn test_zero_image_is_unknown_architecture() {
        let err = analyze(Arc::from(vec![0u8; 64]), "zeros.bin").unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownArchitecture { .. }));
        assert_eq!(err.category(), ErrorCategory::InputError);
    }

    #[test]
    fn test_arm_aes128_detection() {
        let report = analyze(fixtures::aes_image(), "aes.bin").unwrap();
        assert_eq!(report.architecture, Architecture::Arm);
        assert_eq!(report.format, ContainerFormat::Raw);
        assert!(report.arch_confidence >= 0.5);

        let aes = report
            .detections
            .iter()
            .find(|d| d.primary_offset() == 0x14A0)
            .expect("AES detection at the Rcon table");
        assert_eq!(aes.kind, PrimitiveKind::Aes128);
        assert!(aes.confidence >= 0.6);
        // referenced constant (0.9) and a rolled ten-round loop (1.0)
        assert!((aes.confidence - 0.94).abs() < 1e-9);
        assert_eq!(aes.function, Some(0x0));
        assert_eq!(aes.offsets, vec![0x14A0, 0xC]);

        let summary = report.summary();
        assert!(summary["AES"].present);
        assert_eq!(summary["AES"].algorithm, "AES-128");
        assert_eq!(report.compliance.risk_level, RiskLevel::Low);
        assert!(report.compliance.recommendations.is_empty());
    }

    #[test]
    fn test_md5_penalty_and_remediation() {
        let report = analyze(fixtures::md5_image(), "md5.bin").unwrap();
        let md5 = report
            .detections
            .iter()
            .find(|d| d.kind == PrimitiveKind::Md5)
            .expect("MD5 sine table");
        assert_eq!(md5.primary_offset(), 0x400);
        assert!((md5.confidence - 0.6).abs() < 1e-9);

        let verdict = report
            .compliance
            .verdicts
            .iter()
            .find(|v| v.algorithm == "MD5")
            .unwrap();
        assert!(verdict.in_use && verdict.deprecated);

        // 100 * 0.8 * 0.6 / 1 + 20 at the least
        assert!(report.compliance.risk_score >= 68);
        assert_eq!(report.compliance.recommendations[0].title, "Replace MD5 with SHA-256");
        assert!(report
            .compliance
            .recommendations
            .iter()
            .any(|r| r.title == "Implement proper key management"));

        let ruleset = Ruleset::embedded().unwrap();
        assert_eq!(
            report.compliance.risk_score,
            ComplianceScorer::risk_score(&ruleset, &report.detections, &report.protocols)
        );
    }

    #[test]
    fn test_protocol_graphs_are_acyclic() {
        let report = analyze(fixtures::md5_image(), "md5.bin").unwrap();
        for graph in report.protocols.iter() {
            assert!(graph.nodes.len() >= 2);
            assert!((0.0..=1.0).contains(&graph.anomaly_score));
            for edge in graph.edges.iter() {
                // ids follow topological order
                assert!(edge.from < edge.to);
            }
        }
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let first = analyze(fixtures::md5_image(), "md5.bin").unwrap();
        let second = analyze(fixtures::md5_image(), "md5.bin").unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        let offsets: Vec<u64> = first.detections.iter().map(|d| d.primary_offset()).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted);
        assert!(first.detections.iter().all(|d| d.confidence >= 0.2));
    }

    #[test]
    fn test_decode_failure_is_a_diagnostic() {
        let report = analyze(fixtures::partial_decode_image(), "partial.bin").unwrap();
        assert_eq!(report.function_count, 1);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].code, "DecodeError");
        assert_eq!(report.diagnostics[0].category, ErrorCategory::PartialDecodeFailure);
        assert_eq!(report.diagnostics[0].address, Some(0x14));
    }

    #[test]
    fn test_elf_image() {
        let elf = fixtures::arm_elf();
        let report = analyze(Arc::from(elf), "fw.elf").unwrap();
        assert_eq!(report.format, ContainerFormat::Elf);
        assert_eq!(report.architecture, Architecture::Arm);
        assert_eq!(report.arch_confidence, 1.0);
        assert!(report.sections.iter().any(|s| s.name == ".text" && s.permissions.execute));
        assert_eq!(report.function_count, 2);

        // loop without a matching constant
        let aes = report
            .detections
            .iter()
            .find(|d| d.kind == PrimitiveKind::Aes128)
            .unwrap();
        assert!((aes.confidence - 0.4).abs() < 1e-9);
        assert_eq!(aes.function, Some(0x4));
    }

    #[test]
    fn test_truncated_elf() {
        let mut elf = fixtures::arm_elf();
        elf.truncate(72);
        let err = Loader::default().load(Arc::from(elf), Some("cut.elf")).unwrap_err();
        assert_eq!(err.code(), "Truncated");
        assert_eq!(err.category(), ErrorCategory::InputError);
    }
}
