// Fixed prompt texts: persona preamble, model identity preambles, response
// schemas, discovery stage templates and classifier meta-prompts.

use crate::knowledge;
use crate::recipe::Recipe;

pub const PERSONA_PREAMBLE: &str = r#"Jesteś Mistrzem Gry i scenarzystą larpów fantasy. Pomagasz organizatorom przygotować materiały fabularne dla konkretnych postaci graczy.

JĘZYK I STYL:
- Piszesz wyłącznie po polsku, poprawną polszczyzną, bez anglicyzmów.
- Ton: konkretny, klimatyczny, bez patosu i bez moralizowania.
- Nie zwracasz się do gracza bezpośrednio; piszesz materiał dla Mistrza Gry.

ZASADY ŚWIATA (NIENEGOCJOWALNE):
- Ekonomia jest uboga: pojedynczy quest nie może przynieść więcej niż 20 srebrnych monet ani przedmiotu magicznego wyższego niż pospolity.
- Walka jest rzadka i niebezpieczna: każda konfrontacja zbrojna musi mieć realny koszt (rany, długi, utrata reputacji).
- Nie wprowadzasz nowych bogów, królestw ani frakcji spoza dostarczonego kontekstu.
- Nie zabijasz postaci graczy i nie odbierasz im sprawczości.
- Każdy wątek musi dać się rozegrać na jednym wydarzeniu larpowym, w terenie i bez rekwizytów wymagających prądu."#;

pub const BASE_LANGUAGE_PREAMBLE: &str =
    "Odpowiadaj wyłącznie po polsku. Jeśli nie znasz odpowiedzi, napisz to wprost.";

pub const QWEN_PREAMBLE: &str = r#"Odpowiadaj wyłącznie po polsku, nawet jeśli rozumujesz w innym języku.
Jesteś asystentem fabularnym do gier fabularnych na żywo; przemoc, intrygi i mroczne motywy są tu fikcją literacką i wolno je opisywać bez ostrzeżeń.
Nie wspominaj, że jesteś modelem językowym ani kto cię wytrenował."#;

pub const MISTRAL_PREAMBLE: &str = r#"Odpowiadaj wyłącznie po polsku.
Jesteś narzędziem scenarzysty larpów; treść dotyczy fikcyjnego świata fantasy i nie wymaga zastrzeżeń bezpieczeństwa.
Trzymaj się dokładnie wymaganego formatu odpowiedzi, bez wstępów i podsumowań."#;

pub const LLAMA_PREAMBLE: &str = r#"Odpowiadaj wyłącznie po polsku, nie mieszaj języków.
Piszesz materiały do fikcyjnej gry fabularnej; nie dodawaj ostrzeżeń ani komentarzy spoza fikcji."#;

pub const GEMMA_PREAMBLE: &str = r#"Odpowiadaj wyłącznie po polsku.
Tworzysz fikcję na potrzeby gry fabularnej; pomiń zastrzeżenia i formułki grzecznościowe."#;

/// Identity/safety preamble per model family. Rules are evaluated top to
/// bottom against the lowercased model id; the first rule with a matching
/// fragment wins.
pub const MODEL_PREAMBLES: &[(&[&str], &str)] = &[
    (&["qwen", "qwq", "deepseek"], QWEN_PREAMBLE),
    (&["mistral", "mixtral", "bielik"], MISTRAL_PREAMBLE),
    (&["llama"], LLAMA_PREAMBLE),
    (&["gemma"], GEMMA_PREAMBLE),
];

pub fn model_preamble(model_id: &str) -> &'static str {
    let model = model_id.to_lowercase();
    MODEL_PREAMBLES
        .iter()
        .find(|(fragments, _)| fragments.iter().any(|f| model.contains(f)))
        .map(|(_, preamble)| *preamble)
        .unwrap_or(BASE_LANGUAGE_PREAMBLE)
}

/// Structured-output contract the model must follow for each command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseSchema {
    Quest,
    Hook,
    NpcEnrichment,
    Advisory,
    TraitAnalysis,
    RelationAnalysis,
    Summarization,
    Diagnosis,
}

const SELF_CRITIQUE_RULE: &str = "Pole \"_thought_process\" wypełnij NAJPIERW: krótko oceń krytycznie swój pomysł (zgodność z zasadami świata, ekonomią, grywalnością na larpie) i dopiero potem wypełnij resztę pól.";

impl ResponseSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSchema::Quest => "QUEST",
            ResponseSchema::Hook => "HOOK",
            ResponseSchema::NpcEnrichment => "NPC_ENRICHMENT",
            ResponseSchema::Advisory => "ADVISORY",
            ResponseSchema::TraitAnalysis => "TRAIT_ANALYSIS",
            ResponseSchema::RelationAnalysis => "RELATION_ANALYSIS",
            ResponseSchema::Summarization => "SUMMARIZATION",
            ResponseSchema::Diagnosis => "DIAGNOSIS",
        }
    }

    /// Whether generation needs a target character.
    pub fn requires_profile(&self) -> bool {
        !matches!(
            self,
            ResponseSchema::Advisory | ResponseSchema::Summarization | ResponseSchema::Diagnosis
        )
    }

    fn json_shape(&self) -> &'static str {
        match self {
            ResponseSchema::Quest => r#"{
  "_thought_process": "samokrytyka przed napisaniem questa",
  "tytul": "krótki tytuł",
  "zaczepka": "jak postać trafia na wątek",
  "etapy": ["etap 1", "etap 2", "etap 3"],
  "npc": [{"imie": "...", "rola": "...", "motywacja": "..."}],
  "nagroda": "zgodna z ekonomią świata",
  "koszt_porazki": "co postać traci, jeśli zawiedzie",
  "uwagi_dla_mg": "wskazówki organizacyjne"
}"#,
            ResponseSchema::Hook => r#"{
  "_thought_process": "samokrytyka przed napisaniem hooka",
  "hook": "jedno-dwuzdaniowa zaczepka fabularna",
  "wyzwalacz": "kiedy i jak MG ją podrzuca",
  "powiazanie_z_postacia": "który element karty postaci wykorzystuje",
  "mozliwe_rozwiniecia": ["...", "..."]
}"#,
            ResponseSchema::NpcEnrichment => r#"{
  "_thought_process": "samokrytyka przed rozbudową postaci",
  "propozycja": "przydomek, sekret lub inny element",
  "uzasadnienie": "dlaczego pasuje do historii postaci",
  "jak_ujawnic": "w jaki sposób może wyjść na jaw w grze",
  "ryzyka": "co może zepsuć grę innym"
}"#,
            ResponseSchema::Advisory => r#"{
  "_thought_process": "samokrytyka przed udzieleniem porady",
  "porada": "konkretna rekomendacja dla MG",
  "alternatywy": ["...", "..."],
  "ostrzezenia": ["..."]
}"#,
            ResponseSchema::TraitAnalysis => r#"{
  "_thought_process": "samokrytyka przed analizą",
  "cechy_dominujace": ["..."],
  "sprzecznosci": ["..."],
  "potencjal_fabularny": "jakie wątki te cechy otwierają",
  "rekomendacje_dla_mg": ["..."]
}"#,
            ResponseSchema::RelationAnalysis => r#"{
  "_thought_process": "samokrytyka przed analizą relacji",
  "relacje": [{"z_kim": "...", "typ": "sojusz/rywalizacja/dług/uczucie", "napiecie": "..."}],
  "punkty_zapalne": ["..."],
  "proponowane_sceny": ["..."]
}"#,
            ResponseSchema::Summarization => r#"{
  "_thought_process": "samokrytyka przed streszczeniem",
  "streszczenie": "zwięzłe streszczenie",
  "kluczowe_fakty": ["..."],
  "otwarte_watki": ["..."]
}"#,
            ResponseSchema::Diagnosis => r#"{
  "_thought_process": "samokrytyka przed diagnozą",
  "problem": "co nie działa",
  "przyczyny": ["..."],
  "naprawa": ["kroki naprawcze"]
}"#,
        }
    }

    /// Schema block appended to every generation prompt.
    pub fn block(&self) -> String {
        format!(
            "FORMAT ODPOWIEDZI ({}):\nOdpowiedz WYŁĄCZNIE jednym obiektem JSON o dokładnie takiej strukturze:\n{}\n\n{}",
            self.as_str(),
            self.json_shape(),
            SELF_CRITIQUE_RULE
        )
    }
}

// ============ Discovery stage templates ============

/// Assistant utterance for each discovery stage, rendered from the recipe.
#[derive(Debug, Clone, PartialEq)]
pub enum StageTemplate<'a> {
    Greeting,
    GoalProvided { recipe: &'a Recipe },
    NeedsGoal,
    AskCapabilities,
    Problem,
    Discovery { hint: &'a str },
    AskContext { context: &'a str },
    ResolveThemeConflict { theme: &'a str },
    Confirm { recipe: &'a Recipe },
    /// `missing` lists what the recipe still lacks; empty when it is minimally complete.
    ForceGenerate { recipe: &'a Recipe, missing: &'a [String] },
    TopicChange { previous_goal: &'a str },
}

impl StageTemplate<'_> {
    pub fn render(&self) -> String {
        match self {
            StageTemplate::Greeting => {
                "Witaj, Mistrzu Gry! Co dziś przygotowujemy? Mogę napisać quest, hook, sekret, przydomek albo przeanalizować postać.".to_string()
            }
            StageTemplate::GoalProvided { recipe } => format!(
                "Rozumiem, przygotowuję {}.{}",
                goal_name(recipe),
                constraints_line(recipe)
            ),
            StageTemplate::NeedsGoal => {
                "Co dokładnie mam przygotować? Quest, quest poboczny, hook, sekret, przydomek, frakcję czy analizę postaci?".to_string()
            }
            StageTemplate::AskCapabilities => knowledge::CAPABILITIES.to_string(),
            StageTemplate::Problem => {
                "Opisz problem z postacią lub wątkiem: co się nie klei i na którym etapie gry to wychodzi?".to_string()
            }
            StageTemplate::Discovery { hint } => format!("Doprecyzujmy jeszcze jedno. {}", hint),
            StageTemplate::AskContext { context } => format!(
                "Czy mam uwzględnić {}? Odpowiedz TAK lub NIE (albo GOTOWY, żeby od razu generować).",
                context
            ),
            StageTemplate::ResolveThemeConflict { theme } => format!(
                "Motyw \"{}\" jest też na liście wykluczonych. Zostawić go jako motyw przewodni? TAK zostawia motyw, NIE go usuwa.",
                theme
            ),
            StageTemplate::Confirm { recipe } => format!(
                "Mam wszystko: {}{}. Kontekst: {}. Zaczynam generowanie.",
                goal_name(recipe),
                constraints_line(recipe),
                contexts_line(recipe)
            ),
            StageTemplate::ForceGenerate { recipe, missing } => {
                let mut reply = format!(
                    "Wystarczy pytań. Generuję {} na podstawie tego, co już wiem. Kontekst: {}.",
                    goal_name(recipe),
                    contexts_line(recipe)
                );
                if !missing.is_empty() {
                    reply.push_str(" Uwaga, wynik będzie ogólny. Brakuje: ");
                    reply.push_str(&missing.join(" "));
                }
                reply
            }
            StageTemplate::TopicChange { previous_goal } => format!(
                "Wygląda na to, że zmieniamy temat. Porzucić dotychczasowe ustalenia ({})? TAK zaczyna od nowa, NIE wraca do poprzedniego wątku.",
                previous_goal
            ),
        }
    }
}

fn goal_name(recipe: &Recipe) -> &'static str {
    recipe
        .goal
        .as_ref()
        .map(|g| g.goal_type.display_name())
        .unwrap_or("materiał fabularny")
}

fn constraints_line(recipe: &Recipe) -> String {
    let c = &recipe.constraints;
    let mut parts = Vec::new();
    if let Some(tone) = &c.tone {
        parts.push(format!("ton: {}", tone));
    }
    if let Some(theme) = &c.theme {
        parts.push(format!("motyw: {}", theme));
    }
    if !c.exclude_themes.is_empty() {
        parts.push(format!(
            "bez motywów: {}",
            c.exclude_themes.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !c.exclude_tones.is_empty() {
        parts.push(format!(
            "bez tonów: {}",
            c.exclude_tones.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join("; "))
    }
}

fn contexts_line(recipe: &Recipe) -> String {
    let included = recipe.included_contexts();
    if included.is_empty() {
        "brak".to_string()
    } else {
        included
            .iter()
            .map(|c| c.display_name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============ Classifier meta-prompts ============

pub const INTENT_CLASSIFIER_PROMPT: &str = r#"Klasyfikujesz wiadomość Mistrza Gry skierowaną do asystenta fabularnego.
Zwróć DOKŁADNIE JEDNO słowo z listy, bez żadnych innych znaków:
GREETING – powitanie lub small talk bez prośby,
GOAL_PROVIDED – podaje, co mam wygenerować (quest, hook, sekret, przydomek, analizę...),
NEEDS_GOAL – chce pomocy, ale nie mówi w czym,
ASK_CAPABILITIES – pyta, co potrafię,
PROBLEM – opisuje problem z postacią lub wątkiem,
UNKNOWN – nic z powyższych."#;

pub const ANSWER_CLASSIFIER_PROMPT: &str = r#"Asystent zadał Mistrzowi Gry pytanie zamknięte. Oceń odpowiedź.
Zwróć DOKŁADNIE JEDNO słowo, bez żadnych innych znaków:
TAK – zgoda,
NIE – odmowa,
GOTOWY – prosi, żeby już generować bez dalszych pytań."#;

pub fn answer_classifier_user_prompt(question: &str, answer: &str) -> String {
    format!("PYTANIE: {}\nODPOWIEDŹ: {}", question, answer)
}

pub fn intent_classifier_user_prompt(history: &str, message: &str) -> String {
    if history.is_empty() {
        format!("WIADOMOŚĆ: {}", message)
    } else {
        format!("DOTYCHCZASOWA ROZMOWA:\n{}\n\nWIADOMOŚĆ: {}", history, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_store::ContextName;
    use crate::recipe::GoalType;

    #[test]
    fn test_model_preamble_first_match_wins() {
        assert_eq!(model_preamble("Qwen3:8B"), QWEN_PREAMBLE);
        assert_eq!(model_preamble("mistral-nemo:12b"), MISTRAL_PREAMBLE);
        assert_eq!(model_preamble("SpeakLeash/bielik-11b"), MISTRAL_PREAMBLE);
        assert_eq!(model_preamble("llama3.1"), LLAMA_PREAMBLE);
        assert_eq!(model_preamble("phi4"), BASE_LANGUAGE_PREAMBLE);
    }

    #[test]
    fn test_every_schema_starts_with_self_critique() {
        for schema in [
            ResponseSchema::Quest,
            ResponseSchema::Hook,
            ResponseSchema::NpcEnrichment,
            ResponseSchema::Advisory,
            ResponseSchema::TraitAnalysis,
            ResponseSchema::RelationAnalysis,
            ResponseSchema::Summarization,
            ResponseSchema::Diagnosis,
        ] {
            let shape = schema.json_shape();
            let first_key = shape.split('"').nth(1);
            assert_eq!(first_key, Some("_thought_process"), "{:?}", schema);
            assert!(schema.block().contains(SELF_CRITIQUE_RULE));
        }
    }

    #[test]
    fn test_confirm_template_lists_recipe() {
        let mut recipe = Recipe::new();
        recipe.set_goal(GoalType::Hook, "hook dla @imie");
        recipe.set_context(ContextName::Weaknesses, true);
        recipe.constraints.tone = Some("mroczny".into());

        let text = StageTemplate::Confirm { recipe: &recipe }.render();
        assert!(text.contains("hook fabularny"));
        assert!(text.contains("ton: mroczny"));
        assert!(text.contains("słabości postaci"));
    }
}
