/*!
Suite de développement Mirador

Facilite l'écriture de tests d'intégration du kernel sans routeur réel :
- DeviceStub : équipement simulé parlant le protocole API sur TCP
- Profils scriptables : identifiants, valeurs de télémétrie, délais de
  réponse pour simuler pannes et lenteurs
*/

pub mod device_stub;
pub mod wire;

pub use device_stub::{interface, DeviceStub, StubProfile};
