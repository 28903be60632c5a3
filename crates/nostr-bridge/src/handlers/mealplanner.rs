//! Meal planner app handler: keeps `sensor.<prefix>_todays_meal` current from
//! `mmp:plan:<id>` events.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use ha_client::EntityUpsert;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::validation::{sanitize_for_log, validate_url, ValidationError};
use super::{AppHandler, EntityCommand};
use crate::Error;

pub const MEALPLANNER_PREFIX: &str = "mmp:";

const SOURCE: &str = "nostr_mealplanner";
const FRIENDLY_NAME: &str = "Today's Meal";
const NO_MEAL: &str = "No meal planned";
const UNKNOWN_MEAL: &str = "Unknown Meal";
const MAX_TEXT_LENGTH: usize = 255;
/// Plans further ahead than this are not cached.
const CACHE_FUTURE_DAYS: u64 = 30;

/// Fields are read leniently: `null` or an unexpected type falls back to the
/// default instead of rejecting the plan.
#[derive(Debug, Default, Deserialize)]
struct MealData {
    #[serde(default, deserialize_with = "lenient_text")]
    title: Option<String>,
    #[serde(default)]
    rating: Option<Value>,
    #[serde(default, deserialize_with = "lenient_tags")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MealPlan {
    #[serde(default, deserialize_with = "lenient_text")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    date: Option<String>,
    #[serde(default, rename = "updatedAt", deserialize_with = "lenient_text")]
    updated_at: Option<String>,
    #[serde(default, rename = "fromFreezer", deserialize_with = "lenient_flag")]
    from_freezer: bool,
    #[serde(default)]
    meal_id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_meal")]
    meal_data: MealData,
}

fn text_of(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(text_of(Value::deserialize(deserializer)?))
}

fn lenient_tags<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter_map(text_of).collect(),
        Value::String(tag) if !tag.is_empty() => vec![tag],
        _ => Vec::new(),
    })
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(truthy(&Value::deserialize(deserializer)?))
}

fn lenient_meal<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MealData, D::Error> {
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value).map_err(D::Error::custom),
        _ => Ok(MealData::default()),
    }
}

pub struct MealPlannerHandler {
    prefix: String,
    plans: BTreeMap<NaiveDate, MealPlan>,
    last_published: Option<NaiveDate>,
}

impl MealPlannerHandler {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            plans: BTreeMap::new(),
            last_published: None,
        }
    }

    pub fn entity_id(&self) -> String {
        format!("sensor.{}_todays_meal", self.prefix)
    }

    /// Number of cached plans.
    pub fn cached(&self) -> usize {
        self.plans.len()
    }

    pub fn handle_at(
        &mut self,
        payload: Value,
        d_tag: &str,
        today: NaiveDate,
    ) -> Result<Vec<EntityCommand>, ValidationError> {
        let entity_type = d_tag.split(':').nth(1);
        if entity_type != Some("plan") {
            debug!(d_tag = %sanitize_for_log(d_tag), "Ignoring meal planner entity type");
            return Ok(Vec::new());
        }

        if payload.get("_deleted").is_some_and(truthy) {
            let plan_id = d_tag.rsplit(':').next().unwrap_or_default();
            let date = self
                .plans
                .iter()
                .find(|(_, cached)| cached.id.as_deref() == Some(plan_id))
                .map(|(date, _)| *date);
            return Ok(match date {
                Some(date) => {
                    self.plans.remove(&date);
                    info!(%date, "Removed deleted meal plan");
                    vec![self.publish(today)]
                }
                None => Vec::new(),
            });
        }

        let plan: MealPlan = serde_json::from_value(payload)
            .map_err(|e| ValidationError::Malformed(sanitize_for_log(&e.to_string())))?;

        let raw_date = plan.date.as_deref().ok_or(ValidationError::MissingField("date"))?;
        let date = match NaiveDate::parse_from_str(raw_date, "%Y-%m-%d") {
            Ok(date) if in_window(date, today) => date,
            _ => {
                debug!(
                    date = %sanitize_for_log(raw_date),
                    "Ignoring meal plan outside cache window"
                );
                return Ok(Vec::new());
            }
        };

        if let Some(existing) = self.plans.get(&date) {
            if let (Some(incoming), Some(current)) = (&plan.updated_at, &existing.updated_at) {
                if incoming < current {
                    info!(%date, "Skipping older meal plan");
                    return Ok(Vec::new());
                }
            }
        }

        info!(
            %date,
            title = %sanitize_for_log(plan.meal_data.title.as_deref().unwrap_or("<no title>")),
            "Cached meal plan"
        );
        self.plans.insert(date, plan);
        self.prune(today);
        Ok(vec![self.publish(today)])
    }

    pub fn tick_at(&mut self, today: NaiveDate) -> Vec<EntityCommand> {
        self.prune(today);
        if self.last_published == Some(today) {
            return Vec::new();
        }
        info!(%today, "Date changed, refreshing today's meal");
        vec![self.publish(today)]
    }

    fn prune(&mut self, today: NaiveDate) {
        let before = self.plans.len();
        self.plans.retain(|date, _| in_window(*date, today));
        let pruned = before - self.plans.len();
        if pruned > 0 {
            debug!(pruned, "Pruned stale meal plans");
        }
    }

    fn publish(&mut self, today: NaiveDate) -> EntityCommand {
        self.last_published = Some(today);
        let date = today.format("%Y-%m-%d").to_string();

        let mut attributes = Map::new();
        attributes.insert("friendly_name".into(), FRIENDLY_NAME.into());
        attributes.insert("source".into(), SOURCE.into());
        attributes.insert("date".into(), date.into());

        let state = match self.plans.get(&today) {
            Some(plan) => {
                let meal = &plan.meal_data;
                attributes.insert("icon".into(), "mdi:food".into());
                attributes.insert("rating".into(), meal.rating.clone().unwrap_or(Value::Null));
                attributes.insert("from_freezer".into(), plan.from_freezer.into());
                attributes.insert("tags".into(), meal.tags.join(", ").into());
                attributes.insert(
                    "description".into(),
                    truncate(meal.description.as_deref().unwrap_or_default()).into(),
                );
                attributes.insert(
                    "meal_id".into(),
                    plan.meal_id.clone().unwrap_or_else(|| Value::String(String::new())),
                );
                if let Some(image) = meal.image.as_deref().filter(|i| !i.is_empty()) {
                    match validate_url(image) {
                        Ok(_) => {
                            attributes.insert("entity_picture".into(), image.into());
                        }
                        Err(e) => debug!(error = %e, "Omitting meal image"),
                    }
                }
                truncate(meal.title.as_deref().unwrap_or(UNKNOWN_MEAL))
            }
            None => {
                attributes.insert("icon".into(), "mdi:food-off".into());
                NO_MEAL.to_string()
            }
        };

        info!(
            entity_id = %self.entity_id(),
            state = %sanitize_for_log(&state),
            "Publishing today's meal"
        );
        EntityCommand::Upsert(EntityUpsert::new(self.entity_id(), state, attributes))
    }
}

#[async_trait]
impl AppHandler for MealPlannerHandler {
    fn name(&self) -> &str {
        "mealplanner"
    }

    async fn handle(&mut self, payload: Value, d_tag: &str) -> Result<Vec<EntityCommand>, Error> {
        Ok(self.handle_at(payload, d_tag, Local::now().date_naive())?)
    }

    async fn tick(&mut self, today: NaiveDate) -> Vec<EntityCommand> {
        self.tick_at(today)
    }
}

fn in_window(date: NaiveDate, today: NaiveDate) -> bool {
    date >= today
        && today
            .checked_add_days(Days::new(CACHE_FUTURE_DAYS))
            .map_or(true, |end| date <= end)
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_TEXT_LENGTH).collect()
}
