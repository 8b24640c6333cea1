//! Resource types known to the replica
//!
//! Each resource type carries its dependency list, watermark key, REST
//! endpoint and foreign-key fields as data, so the orchestrator can iterate
//! them generically instead of branching on names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a resource type is server-defined metadata or clinical data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    Metadata,
    DataValues,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    OrganisationUnits,
    OptionSets,
    Constants,
    TrackedEntityTypes,
    TrackedEntityAttributes,
    DataElements,
    RelationshipTypes,
    Programs,
    ProgramStages,
    ProgramTrackedEntityAttributes,
    ProgramRules,
    ProgramRuleVariables,
    ProgramRuleActions,
    ValidationRules,
    TrackedEntityInstances,
    Enrollments,
    Events,
    DataValues,
}

/// A payload field holding the identifier of another record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: ResourceType,
}

const fn reference(field: &'static str, target: ResourceType) -> Reference {
    Reference { field, target }
}

impl ResourceType {
    /// Every resource type, in declaration order
    pub const ALL: [ResourceType; 18] = [
        ResourceType::OrganisationUnits,
        ResourceType::OptionSets,
        ResourceType::Constants,
        ResourceType::TrackedEntityTypes,
        ResourceType::TrackedEntityAttributes,
        ResourceType::DataElements,
        ResourceType::RelationshipTypes,
        ResourceType::Programs,
        ResourceType::ProgramStages,
        ResourceType::ProgramTrackedEntityAttributes,
        ResourceType::ProgramRules,
        ResourceType::ProgramRuleVariables,
        ResourceType::ProgramRuleActions,
        ResourceType::ValidationRules,
        ResourceType::TrackedEntityInstances,
        ResourceType::Enrollments,
        ResourceType::Events,
        ResourceType::DataValues,
    ];

    pub fn category(self) -> ResourceCategory {
        match self {
            ResourceType::TrackedEntityInstances
            | ResourceType::Enrollments
            | ResourceType::Events
            | ResourceType::DataValues => ResourceCategory::DataValues,
            _ => ResourceCategory::Metadata,
        }
    }

    pub fn is_metadata(self) -> bool {
        self.category() == ResourceCategory::Metadata
    }

    /// Resource types that must be present locally before this one is synced
    pub fn dependencies(self) -> &'static [ResourceType] {
        use ResourceType::*;
        match self {
            OrganisationUnits | OptionSets | Constants | TrackedEntityTypes | RelationshipTypes => &[],
            TrackedEntityAttributes | DataElements => &[OptionSets],
            Programs => &[OrganisationUnits, OptionSets, Constants, TrackedEntityTypes],
            ProgramStages => &[Programs, DataElements],
            ProgramTrackedEntityAttributes => &[Programs, TrackedEntityAttributes],
            ProgramRules => &[Programs, ProgramStages],
            ProgramRuleVariables => &[Programs, DataElements, TrackedEntityAttributes],
            ProgramRuleActions => &[ProgramRules, DataElements],
            ValidationRules => &[DataElements],
            TrackedEntityInstances => &[OrganisationUnits, TrackedEntityTypes, TrackedEntityAttributes],
            Enrollments => &[Programs, TrackedEntityInstances],
            Events => &[OrganisationUnits, Programs, ProgramStages, Enrollments],
            DataValues => &[Events, DataElements],
        }
    }

    /// Whether an installation may switch loading of this type off.
    /// The remaining types are always loaded.
    pub fn is_toggleable(self) -> bool {
        !matches!(
            self,
            ResourceType::OrganisationUnits | ResourceType::Programs | ResourceType::ProgramStages
        )
    }

    /// Key used for watermarks and load flags
    pub fn watermark_key(self) -> &'static str {
        use ResourceType::*;
        match self {
            OrganisationUnits => "organisation_units",
            OptionSets => "option_sets",
            Constants => "constants",
            TrackedEntityTypes => "tracked_entity_types",
            TrackedEntityAttributes => "tracked_entity_attributes",
            DataElements => "data_elements",
            RelationshipTypes => "relationship_types",
            Programs => "programs",
            ProgramStages => "program_stages",
            ProgramTrackedEntityAttributes => "program_tracked_entity_attributes",
            ProgramRules => "program_rules",
            ProgramRuleVariables => "program_rule_variables",
            ProgramRuleActions => "program_rule_actions",
            ValidationRules => "validation_rules",
            TrackedEntityInstances => "tracked_entity_instances",
            Enrollments => "enrollments",
            Events => "events",
            DataValues => "data_values",
        }
    }

    /// REST collection name
    pub fn endpoint(self) -> &'static str {
        use ResourceType::*;
        match self {
            OrganisationUnits => "organisationUnits",
            OptionSets => "optionSets",
            Constants => "constants",
            TrackedEntityTypes => "trackedEntityTypes",
            TrackedEntityAttributes => "trackedEntityAttributes",
            DataElements => "dataElements",
            RelationshipTypes => "relationshipTypes",
            Programs => "programs",
            ProgramStages => "programStages",
            ProgramTrackedEntityAttributes => "programTrackedEntityAttributes",
            ProgramRules => "programRules",
            ProgramRuleVariables => "programRuleVariables",
            ProgramRuleActions => "programRuleActions",
            ValidationRules => "validationRules",
            TrackedEntityInstances => "trackedEntityInstances",
            Enrollments => "enrollments",
            Events => "events",
            DataValues => "dataValues",
        }
    }

    /// Name of the identifier field in wire payloads
    pub fn id_field(self) -> &'static str {
        match self {
            ResourceType::TrackedEntityInstances => "trackedEntityInstance",
            ResourceType::Enrollments => "enrollment",
            ResourceType::Events => "event",
            _ => "id",
        }
    }

    /// Payload fields that point at other records. Locally they are stored
    /// as surrogate keys, never as global identifiers.
    pub fn references(self) -> &'static [Reference] {
        use ResourceType::*;
        const PROGRAM_STAGE_REFS: &[Reference] = &[reference("program", Programs)];
        const PROGRAM_ATTRIBUTE_REFS: &[Reference] = &[
            reference("program", Programs),
            reference("trackedEntityAttribute", TrackedEntityAttributes),
        ];
        const PROGRAM_RULE_REFS: &[Reference] = &[reference("program", Programs)];
        const RULE_ACTION_REFS: &[Reference] = &[reference("programRule", ProgramRules)];
        const ENROLLMENT_REFS: &[Reference] = &[
            reference("trackedEntityInstance", TrackedEntityInstances),
            reference("program", Programs),
            reference("orgUnit", OrganisationUnits),
        ];
        const EVENT_REFS: &[Reference] = &[
            reference("enrollment", Enrollments),
            reference("trackedEntityInstance", TrackedEntityInstances),
            reference("program", Programs),
            reference("programStage", ProgramStages),
            reference("orgUnit", OrganisationUnits),
        ];
        const DATA_VALUE_REFS: &[Reference] = &[
            reference("event", Events),
            reference("dataElement", DataElements),
        ];
        match self {
            ProgramStages => PROGRAM_STAGE_REFS,
            ProgramTrackedEntityAttributes => PROGRAM_ATTRIBUTE_REFS,
            ProgramRules | ProgramRuleVariables => PROGRAM_RULE_REFS,
            ProgramRuleActions => RULE_ACTION_REFS,
            Enrollments => ENROLLMENT_REFS,
            Events => EVENT_REFS,
            DataValues => DATA_VALUE_REFS,
            _ => &[],
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|rt| rt.watermark_key() == key)
    }

    /// All resource types of a category in a dependency-respecting order.
    ///
    /// Kahn's algorithm over the declared dependencies, ties broken by
    /// declaration order so the result is stable across runs.
    pub fn sync_order(category: ResourceCategory) -> Vec<ResourceType> {
        topological_order()
            .into_iter()
            .filter(|rt| rt.category() == category)
            .collect()
    }
}

/// Dependency order over every resource type
pub fn topological_order() -> Vec<ResourceType> {
    let mut ordered: Vec<ResourceType> = Vec::with_capacity(ResourceType::ALL.len());
    while ordered.len() < ResourceType::ALL.len() {
        let next = ResourceType::ALL.into_iter().find(|rt| {
            !ordered.contains(rt) && rt.dependencies().iter().all(|dep| ordered.contains(dep))
        });
        match next {
            Some(rt) => ordered.push(rt),
            // A cycle in the declared dependencies; the tests guard against this
            None => break,
        }
    }
    ordered
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.watermark_key())
    }
}
