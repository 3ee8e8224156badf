mod common;
use common::*;
use sma_bridge::error::Error;
use sma_bridge::prelude::*;
use sma_bridge::sma::data_point::{DataType, DeviceClass, Unit};

#[test]
fn lookup_prefers_exact_code() {
    assert_eq!(DataPoint::lookup(0x0125_1E01), Some(DataPoint::DcMsWatt1));
    assert_eq!(DataPoint::lookup(0x0125_1E02), Some(DataPoint::DcMsWatt2));
}

#[test]
fn lookup_falls_back_to_family() {
    // class byte 1 with a type tag in the top byte
    assert_eq!(DataPoint::lookup(0x0026_0101), Some(DataPoint::MeteringTotWhOut));
    assert_eq!(DataPoint::lookup(0x4026_3F01), Some(DataPoint::GridMsTotW));
}

#[test]
fn lookup_misses_unknown_codes() {
    assert_eq!(DataPoint::lookup(0x0026_3E01), None);
    assert_eq!(DataPoint::lookup(0), None);
}

#[test]
fn resolves_mnemonics_and_codes() -> Result<()> {
    assert_eq!(DataPoint::from_name("SPOT_ETOTAL")?, DataPoint::MeteringTotWhOut);
    assert_eq!(DataPoint::from_name("spot_pactotal")?, DataPoint::GridMsTotW);
    assert_eq!(DataPoint::from_name("SPOT_UDC2")?, DataPoint::DcMsVol2);
    assert_eq!(DataPoint::from_name("0x00416600")?, DataPoint::OperationRmgTms);
    assert_eq!(DataPoint::from_name("2490624")?, DataPoint::MeteringTotWhOut);
    assert_eq!(DataPoint::from_str(" INV_NAME ")?, DataPoint::NameplateLocation);

    assert!(matches!(
        DataPoint::from_name("SPOT_NOPE"),
        Err(Error::UnknownDataPoint(name)) if name == "SPOT_NOPE"
    ));

    Ok(())
}

#[test]
fn names_fall_back_to_hex_code() {
    assert_eq!(DataPoint::GridMsHz.name(), "SPOT_FREQ");
    assert_eq!(DataPoint::OperationRmgTms.name(), "0x00416600");
    assert_eq!(DataPoint::OperationRmgTms.mnemonic(), None);
    assert_eq!(DataPoint::BatAmp.to_string(), "BAT_CURRENT");
}

#[test]
fn mnemonics_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for dp in DataPoint::ALL {
        if let Some(m) = dp.mnemonic() {
            assert!(seen.insert(m), "{} is used twice", m);
        }
    }
}

#[test]
fn definitions_carry_type_and_unit() {
    assert_eq!(DataPoint::MeteringTotWhOut.data_type(), DataType::U64);
    assert_eq!(DataPoint::MeteringTotWhOut.unit(), Unit::KilowattHour);
    assert_eq!(DataPoint::MeteringTotOpTms.unit(), Unit::Hour);
    assert_eq!(DataPoint::GridMsPhVphsA.unit(), Unit::Volt);
    assert_eq!(DataPoint::NameplateLocation.data_type(), DataType::Text);
    assert_eq!(DataPoint::NameplatePkgRev.data_type(), DataType::Version);
    assert_eq!(DataPoint::OperationHealth.data_type(), DataType::Status);
}

#[test]
fn record_size_follows_data_type() {
    assert_eq!(DataType::I32.record_size(), 28);
    assert_eq!(DataType::U16.record_size(), 28);
    assert_eq!(DataType::U64.record_size(), 16);
    assert_eq!(DataType::Text.record_size(), 40);
    assert_eq!(DataType::Status.record_size(), 40);
    assert_eq!(DataType::Version.record_size(), 40);
}

#[test]
fn units_scale_raw_values() {
    assert_eq!(Unit::Volt.scale(23012.0), 230.12);
    assert_eq!(Unit::Hertz.scale(5001.0), 50.01);
    assert_eq!(Unit::Amp.scale(1500.0), 1.5);
    assert_eq!(Unit::KilowattHour.scale(5_000_000.0), 5000.0);
    assert_eq!(Unit::Hour.scale(7200.0), 2.0);
    assert_eq!(Unit::Watt.scale(1500.0), 1500.0);
}

#[test]
fn every_group_has_members_within_its_range() {
    for group in QueryGroup::ALL {
        let members: Vec<DataPoint> = group.data_points().collect();
        assert!(!members.is_empty(), "{:?} has no data points", group);
        for dp in members {
            let code = dp.code() & 0x00FF_FF00;
            assert!(
                code >= group.first() & 0x00FF_FF00 && code <= group.last(),
                "{} outside {:?}",
                dp,
                group
            );
        }
    }
}

#[test]
fn energy_production_group() {
    let group = QueryGroup::EnergyProduction;
    let members: Vec<DataPoint> = group.data_points().collect();

    assert_eq!(members, vec![DataPoint::MeteringTotWhOut, DataPoint::MeteringDyWhOut]);
    assert_eq!(group.command(), 0x5400_0200);
    assert_eq!(group.first(), 0x0026_0100);
    assert_eq!(group.last(), 0x0026_22FF);
}

#[test]
fn device_class_names() {
    assert_eq!(DeviceClass::SolarInverter.to_string(), "Solar Inverter");
    assert_eq!(DeviceClass::try_from(8007u32).ok(), Some(DeviceClass::Battery));
    assert_eq!(Value::Attribute(8001).to_string(), "Solar Inverter");
    assert_eq!(Value::Attribute(307).to_string(), "307");
}
