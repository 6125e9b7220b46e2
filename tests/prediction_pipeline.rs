//! End-to-end tests for the ingest → bin → predict pipeline

#[cfg(test)]
mod tests {
    use oraclecast::adapter::{Adapter, AdapterRegistry};
    use oraclecast::aggregate::Aggregator;
    use oraclecast::calibration::{select_candidate, CalibrationEngine};
    use oraclecast::chain::Transmission;
    use oraclecast::config::{CalibrationConfig, FeedSpec};
    use oraclecast::ingest::TickIngestor;
    use oraclecast::prediction::PredictionService;
    use oraclecast::report;
    use oraclecast::store::TickStore;
    use oraclecast::types::{Exchange, OracleConfig, OracleSample, Trade};

    use ethers::abi::{encode as abi_encode, Token};
    use ethers::types::{Address, H256, I256, U256};
    use std::time::Duration;

    const ORACLE_ADDR: &str = "0x6ce185860a4963106506c203335a2910413708e9";
    const BUCKET_START: i64 = 1_699_000_000_000;

    fn oracle_addr() -> Address {
        ORACLE_ADDR.parse().unwrap()
    }

    fn oracle_config(store: &TickStore, decimals: u32, scale_factor: U256) -> OracleConfig {
        let cfg = OracleConfig {
            chain_id: 42161,
            oracle_addr: oracle_addr(),
            heartbeat_secs: 86_400,
            deviation_bps: 10,
            decimals,
            scale_factor,
            lag_secs: 0,
        };
        store.seed_oracle_config(&cfg).unwrap();
        cfg
    }

    fn pipeline() -> (TickStore, Aggregator, TickIngestor) {
        let store = TickStore::open_memory().unwrap();
        let aggregator = Aggregator::new(store.clone(), 2_000, 300);
        let ingestor =
            TickIngestor::new(store.clone(), aggregator.clone(), Duration::from_millis(500));
        (store, aggregator, ingestor)
    }

    /// Three trades per exchange inside one 100ms bucket.
    fn ingest_bucket(ingestor: &TickIngestor) {
        for source in Exchange::all() {
            for (i, price) in [100.0, 101.0, 102.0].iter().enumerate() {
                ingestor.enqueue(Trade {
                    symbol: "BTCUSDC".to_string(),
                    source,
                    ts_ms: BUCKET_START + 10 + i as i64 * 20,
                    price: *price,
                });
            }
        }
        ingestor.flush();
    }

    #[test]
    fn ingest_to_price_at_round_trip() {
        let (store, aggregator, ingestor) = pipeline();
        ingest_bucket(&ingestor);

        assert_eq!(store.trade_count().unwrap(), 9);
        // per-source median of {100, 101, 102} is 101; the trimmed median
        // across three identical per-source values is 101 again
        assert_eq!(
            aggregator.price_at("BTCUSDC", BUCKET_START + 100).unwrap(),
            Some(101.0)
        );

        for source in Exchange::all() {
            let bin = store
                .source_bin_near("BTCUSDC", source, BUCKET_START, 1_000)
                .unwrap()
                .unwrap();
            assert_eq!(bin.price, 101.0);
        }
    }

    #[test]
    fn prediction_applies_adapter_fixed_point() {
        let (store, aggregator, ingestor) = pipeline();
        for source in Exchange::all() {
            ingestor.enqueue(Trade {
                symbol: "BTCUSDC".to_string(),
                source,
                ts_ms: BUCKET_START,
                price: 65_000.123_456_78,
            });
        }
        ingestor.flush();

        let cfg = oracle_config(&store, 8, U256::exp10(28));
        let mut registry = AdapterRegistry::new("BTCUSDC".to_string());
        registry.insert(
            (cfg.chain_id, cfg.oracle_addr),
            Adapter::SingleFeed {
                symbol: "BTCUSDC".to_string(),
            },
        );
        let service = PredictionService::new(store, aggregator, registry);

        let prediction = service
            .predicted_at(&cfg, BUCKET_START + 500, 0)
            .unwrap()
            .unwrap();
        assert!(prediction.adapter_verified);
        assert_eq!(prediction.answer, 65_000.123_456_78);
        assert_eq!(
            prediction.fixed_point,
            U256::from_dec_str("65000123456780000000000000000000000000000").unwrap()
        );
    }

    #[test]
    fn transmit_decision_end_to_end() {
        let (store, aggregator, ingestor) = pipeline();
        for source in Exchange::all() {
            ingestor.enqueue(Trade {
                symbol: "BTCUSDC".to_string(),
                source,
                ts_ms: BUCKET_START,
                price: 100.10,
            });
        }
        ingestor.flush();

        let cfg = oracle_config(&store, 2, U256::exp10(34));
        store
            .insert_sample(&OracleSample {
                chain_id: cfg.chain_id,
                oracle_addr: cfg.oracle_addr,
                block_number: 1,
                tx_hash: H256::repeat_byte(1),
                answer: I256::from(10_000), // 100.00
                cex_price_at_observation: 100.0,
                event_ts_ms: BUCKET_START - 1_000,
                error_bps: 0.0,
            })
            .unwrap();

        let registry = AdapterRegistry::new("BTCUSDC".to_string());
        let service = PredictionService::new(store, aggregator, registry);

        let check = service
            .should_transmit(&cfg, BUCKET_START + 100)
            .unwrap()
            .unwrap();
        assert!(check.should_transmit);
        assert!(check.reasons.deviation);
        assert!(!check.reasons.heartbeat);
        assert_eq!(check.deviation_bps, 10.0);
    }

    /// Synthetic transmit calldata in the OCR2 shape carrying `observations`.
    fn transmit_calldata(observations: &[I256]) -> Vec<u8> {
        let mut report = Vec::new();
        report.extend_from_slice(&[0u8; 64]);
        let mut word = [0u8; 32];
        U256::from(96u64).to_big_endian(&mut word);
        report.extend_from_slice(&word);
        U256::from(observations.len()).to_big_endian(&mut word);
        report.extend_from_slice(&word);
        for obs in observations {
            obs.into_raw().to_big_endian(&mut word);
            report.extend_from_slice(&word);
        }

        let body = abi_encode(&[
            Token::FixedArray(vec![Token::FixedBytes(vec![0u8; 32]); 3]),
            Token::Bytes(report),
            Token::Array(vec![Token::FixedBytes(vec![1u8; 32])]),
            Token::Array(vec![Token::FixedBytes(vec![2u8; 32])]),
            Token::FixedBytes(vec![0u8; 32]),
        ]);
        let mut call = vec![0xb1, 0xdc, 0x65, 0xa4];
        call.extend_from_slice(&body);
        call
    }

    #[test]
    fn decoded_transmissions_drive_calibration() {
        let (store, aggregator, ingestor) = pipeline();

        // steady 100.0 coverage, one second apart, from every exchange
        for i in 0..30 {
            for source in Exchange::all() {
                ingestor.enqueue(Trade {
                    symbol: "BTCUSDC".to_string(),
                    source,
                    ts_ms: BUCKET_START + i * 1_000,
                    price: 100.0,
                });
            }
        }
        ingestor.flush();

        // on-chain answers decoded from synthetic transmit calldata:
        // median of {99.99, 100.00, 100.01} at 8 decimals
        let observations = [
            I256::from(9_999_000_000i64),
            I256::from(10_000_000_000i64),
            I256::from(10_001_000_000i64),
        ];
        let calldata = transmit_calldata(&observations);
        let (_, answer) = report::decode_any(&calldata).unwrap();
        assert_eq!(answer, I256::from(10_000_000_000i64));

        let samples: Vec<Transmission> = (0..12)
            .map(|i| Transmission {
                block_number: 100 + i as u64,
                tx_hash: H256::repeat_byte(i as u8),
                timestamp_ms: BUCKET_START + 5_000 + i * 1_000,
                answer,
            })
            .collect();

        let feeds: Vec<FeedSpec> = Exchange::all()
            .into_iter()
            .map(|exchange| FeedSpec {
                exchange,
                symbol: "BTCUSDC".to_string(),
                instrument: "BTCUSDT".to_string(),
            })
            .collect();
        let engine = CalibrationEngine::new(
            store,
            aggregator,
            feeds,
            CalibrationConfig {
                enabled: true,
                interval_secs: 3_600,
                max_samples: 60,
                lag_max_ms: 3_000,
                lag_step_ms: 100,
                lookback_blocks: 1_000,
                chunk_blocks: 100,
                pause_ms: 0,
            },
        );

        let weights = engine.uniform_weights("BTCUSDC");
        assert_eq!(weights.len(), 3);

        let mut candidates = Vec::new();
        for lag_ms in (0..=3_000i64).step_by(100) {
            if let Some(c) = engine.evaluate("BTCUSDC", &samples, 8, lag_ms, &weights, 10) {
                candidates.push(c);
            }
        }
        assert_eq!(candidates.len(), 31);

        // flat price series: every lag predicts perfectly
        let winner = select_candidate(candidates).unwrap();
        assert_eq!(winner.p90_err_bps, 0.0);
        assert_eq!(winner.used_samples, 12);
    }
}
