use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};
use serde_sarif::sarif::Result as SarifResult;
use serde_sarif::sarif::{
    ArtifactLocation, Invocation, Location, LogicalLocation, Message, PhysicalLocation,
    PropertyBag, Region, ReportingDescriptor, Run, SCHEMA_URL, Sarif, Tool, ToolComponent,
};

use crate::collection::WarningCollection;
use crate::telemetry::{Telemetry, with_span};
use crate::warning::WarningRecord;

/// Lifecycle label of a record relative to the collection's own run.
pub(crate) fn lifecycle_label(record: &WarningRecord, sequence_number: i64) -> &'static str {
    if record.is_dead() {
        "absent"
    } else if record.first_version == sequence_number {
        "new"
    } else {
        "unchanged"
    }
}

/// Builds a SARIF log with one result per reported warning of `collection`.
pub(crate) fn build_sarif(
    telemetry: Option<&Telemetry>,
    collection: &WarningCollection,
    include_fixed: bool,
) -> Sarif {
    with_span(telemetry, "sarif.build", &[], || {
        let records: Vec<&WarningRecord> = collection
            .records
            .iter()
            .filter(|record| include_fixed || record.is_active())
            .collect();
        let rule_ids: BTreeSet<&str> = records
            .iter()
            .map(|record| record.pattern_type.as_str())
            .collect();
        let rules: Vec<ReportingDescriptor> = rule_ids
            .into_iter()
            .map(|id| ReportingDescriptor::builder().id(id.to_string()).build())
            .collect();
        let results: Vec<SarifResult> = records
            .into_iter()
            .map(|record| build_result(record, collection.sequence_number))
            .collect();

        let semantic_version = env!("CARGO_PKG_VERSION").to_string();
        let driver = if rules.is_empty() {
            ToolComponent::builder()
                .name("bugtrail")
                .semantic_version(semantic_version)
                .build()
        } else {
            ToolComponent::builder()
                .name("bugtrail")
                .rules(rules)
                .semantic_version(semantic_version)
                .build()
        };
        let tool = Tool {
            driver,
            extensions: None,
            properties: None,
        };
        let run = Run::builder()
            .tool(tool)
            .invocations(vec![build_invocation(collection)])
            .results(results)
            .build();

        Sarif::builder()
            .schema(SCHEMA_URL)
            .runs(vec![run])
            .version(json!("2.1.0"))
            .build()
    })
}

fn build_invocation(collection: &WarningCollection) -> Invocation {
    let mut properties = BTreeMap::new();
    properties.insert(
        "bugtrail.release".to_string(),
        json!(collection.release_name),
    );
    properties.insert(
        "bugtrail.sequence".to_string(),
        json!(collection.sequence_number),
    );
    properties.insert(
        "bugtrail.versions".to_string(),
        json!(collection.app_versions.len() + 1),
    );
    Invocation::builder()
        .execution_successful(true)
        .properties(
            PropertyBag::builder()
                .additional_properties(properties)
                .build(),
        )
        .build()
}

fn build_result(record: &WarningRecord, sequence_number: i64) -> SarifResult {
    let mut properties: BTreeMap<String, Value> = BTreeMap::new();
    properties.insert(
        "bugtrail.lifecycle".to_string(),
        json!(lifecycle_label(record, sequence_number)),
    );
    properties.insert(
        "bugtrail.firstVersion".to_string(),
        json!(record.first_version),
    );
    properties.insert(
        "bugtrail.lastVersion".to_string(),
        json!(record.last_version),
    );
    properties.insert("bugtrail.priority".to_string(), json!(record.priority));
    if !record.annotation_text.is_empty() {
        properties.insert(
            "bugtrail.annotation".to_string(),
            json!(record.annotation_text),
        );
    }

    SarifResult::builder()
        .rule_id(record.pattern_type.clone())
        .message(Message::builder().text(record.describe()).build())
        .locations(vec![build_location(record)])
        .properties(
            PropertyBag::builder()
                .additional_properties(properties)
                .build(),
        )
        .build()
}

fn build_location(record: &WarningRecord) -> Location {
    let location = &record.location;
    let member = location
        .method_signature
        .as_deref()
        .or(location.field_name.as_deref());
    let logical_name = match member {
        Some(member) => format!("{}.{member}", location.class_name),
        None => location.class_name.clone(),
    };
    let logical = LogicalLocation::builder().name(logical_name).build();
    match &location.source_file {
        Some(source_file) => {
            let artifact = ArtifactLocation::builder().uri(source_file.clone()).build();
            let physical = match location.source_line {
                Some(line) => PhysicalLocation::builder()
                    .artifact_location(artifact)
                    .region(Region::builder().start_line(i64::from(line)).build())
                    .build(),
                None => PhysicalLocation::builder()
                    .artifact_location(artifact)
                    .build(),
            };
            Location::builder()
                .logical_locations(vec![logical])
                .physical_location(physical)
                .build()
        }
        None => Location::builder().logical_locations(vec![logical]).build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warning::method_warning;

    fn sample_collection() -> WarningCollection {
        let mut fresh = method_warning("NP_NULL", "com.example.Foo", "run()V", 12);
        fresh.first_version = 3;
        fresh.location.source_file = Some("com/example/Foo.java".to_string());
        let mut old = method_warning("DM_GC", "com.example.Foo", "gc()V", 3);
        old.first_version = 1;
        let mut fixed = method_warning("SE_BAD_FIELD", "com.example.Bar", "write()V", 8);
        fixed.first_version = 1;
        fixed.last_version = 2;
        let collection = WarningCollection {
            release_name: "1.3".to_string(),
            sequence_number: 3,
            ..WarningCollection::default()
        };
        collection.with_records(vec![fresh, old, fixed])
    }

    fn lifecycles(value: &Value) -> Vec<(String, String)> {
        value["runs"][0]["results"]
            .as_array()
            .expect("results array")
            .iter()
            .map(|result| {
                (
                    result["ruleId"].as_str().expect("rule id").to_string(),
                    result["properties"]["bugtrail.lifecycle"]
                        .as_str()
                        .expect("lifecycle")
                        .to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn sarif_is_minimal_and_valid_shape() {
        let sarif = build_sarif(None, &WarningCollection::default(), false);
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        assert_eq!(value["version"], "2.1.0");
        assert_eq!(value["$schema"], SCHEMA_URL);
        assert_eq!(value["runs"][0]["tool"]["driver"]["name"], "bugtrail");
        assert_eq!(
            value["runs"][0]["tool"]["driver"]["semanticVersion"],
            env!("CARGO_PKG_VERSION")
        );
        assert!(
            value["runs"][0]["results"]
                .as_array()
                .expect("results array")
                .is_empty()
        );
        assert_eq!(
            value["runs"][0]["invocations"][0]["executionSuccessful"],
            true
        );
    }

    #[test]
    fn results_carry_lifecycle_of_active_warnings() {
        let sarif = build_sarif(None, &sample_collection(), false);
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        assert_eq!(
            lifecycles(&value),
            vec![
                ("DM_GC".to_string(), "unchanged".to_string()),
                ("NP_NULL".to_string(), "new".to_string()),
            ]
        );
        let rules = value["runs"][0]["tool"]["driver"]["rules"]
            .as_array()
            .expect("rules array");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn fixed_warnings_are_reported_as_absent_on_request() {
        let sarif = build_sarif(None, &sample_collection(), true);
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");

        assert!(lifecycles(&value).contains(&("SE_BAD_FIELD".to_string(), "absent".to_string())));
    }

    #[test]
    fn locations_use_member_and_source_file() {
        let sarif = build_sarif(None, &sample_collection(), false);
        let value = serde_json::to_value(&sarif).expect("serialize SARIF");
        let location = &value["runs"][0]["results"][1]["locations"][0];

        assert_eq!(
            location["logicalLocations"][0]["name"],
            "com.example.Foo.run()V"
        );
        assert_eq!(
            location["physicalLocation"]["artifactLocation"]["uri"],
            "com/example/Foo.java"
        );
        assert_eq!(location["physicalLocation"]["region"]["startLine"], 12);
        assert!(
            value["runs"][0]["results"][0]["locations"][0]["physicalLocation"].is_null()
        );
    }
}
